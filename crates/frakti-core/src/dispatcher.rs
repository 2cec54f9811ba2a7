//! Dispatcher (C9, spec §4.9): the single entry point the CRI surface calls
//! into. Classifies sandboxes to a backend, resolves existing ids via the
//! Routing Registry (C8), and fans out list/image calls across every
//! enabled backend.

use crate::backend::{ImageBackend, ImageInfo, PodBackend};
use crate::checkpoint::CheckpointStore;
use crate::container::{ContainerConfig, ContainerFilter, ContainerManager};
use crate::error::{FraktiError, Result};
use crate::image::ImageManager;
use crate::recovery;
use crate::registry::RoutingRegistry;
use crate::sandbox::{PodSandboxConfig, PodSandboxFilter, SandboxManager};
use crate::types::{Backend, Container, Sandbox, SandboxState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

const UNIKERNEL_OSCONTAINER_ANNOTATION: &str = "runtime.frakti.alpha.kubernetes.io/OSContainer";
const UNIKERNEL_ANNOTATION: &str = "runtime.frakti.alpha.kubernetes.io/Unikernel";
/// Width of the bounded worker pool used for image fan-out (spec §4.9).
const IMAGE_FANOUT_WIDTH: usize = 2;

/// One fully-wired hypervisor or privileged backend: the three manager
/// wrappers that share its `PodBackend`/`ContainerBackend`/`ImageBackend`
/// handle plus its `BackendInfo` for `Version`/`Status`.
pub struct BackendHandle {
    pub sandboxes: SandboxManager,
    pub containers: ContainerManager,
    pub images: ImageManager,
    pub pod_backend: Arc<dyn PodBackend>,
    pub image_backend: Arc<dyn ImageBackend>,
    pub info: Arc<dyn crate::backend::BackendInfo>,
}

pub struct Dispatcher {
    registry: Arc<RoutingRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    hypervisor: BackendHandle,
    privileged: Option<BackendHandle>,
    unikernel: Option<(Arc<dyn ImageBackend>, String)>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RoutingRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        hypervisor: BackendHandle,
        privileged: Option<BackendHandle>,
        unikernel: Option<(Arc<dyn ImageBackend>, String)>,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            hypervisor,
            privileged,
            unikernel,
        }
    }

    fn handle_for(&self, backend: Backend) -> Option<&BackendHandle> {
        match backend {
            Backend::Privileged => self.privileged.as_ref(),
            Backend::Unikernel => None,
        }
    }

    /// Startup reconciliation, spec §4.9: populate the Routing Registry from
    /// every non-default backend's own listings so routing survives a
    /// process restart without its own on-disk state.
    pub async fn reconcile_registry_on_startup(&self) -> Result<()> {
        if let Some(privileged) = &self.privileged {
            for pod in privileged.sandboxes.list_pod_sandbox(&PodSandboxFilter::default()).await? {
                self.registry.add(&pod.id, Backend::Privileged).await;
            }
            for container in privileged.containers.list_containers(&ContainerFilter::default()).await? {
                self.registry.add(&container.id, Backend::Privileged).await;
            }
        }
        Ok(())
    }

    /// Sandbox classification, spec §4.9.1.
    pub fn classify(config: &PodSandboxConfig, unikernel_enabled: bool) -> Backend2 {
        if config.annotations.get(UNIKERNEL_OSCONTAINER_ANNOTATION).map(String::as_str) == Some("true") {
            return Backend2::Privileged;
        }
        if config.security_privileged {
            return Backend2::Privileged;
        }
        if config.host_network || config.host_pid || config.host_ipc {
            return Backend2::Privileged;
        }
        if unikernel_enabled
            && config.annotations.get(UNIKERNEL_ANNOTATION).map(String::as_str) == Some("true")
        {
            return Backend2::Unikernel;
        }
        Backend2::Hypervisor
    }

    /// Unikernel image detection, spec §4.9.2.
    pub fn is_unikernel_image(image_ref: &str, prefix: &str) -> bool {
        let Some(stripped) = image_ref.strip_prefix(prefix) else {
            return false;
        };
        let stripped = stripped.strip_suffix(":latest").unwrap_or(stripped);
        !stripped.is_empty() && stripped.contains('/')
    }

    /// RunPodSandbox, spec §4.9: classify, create only in that backend,
    /// registering the id if the backend is non-default. The unikernel
    /// backend is image-only (spec §4.9.1 note): a `Unikernel`-classified pod
    /// still gets its sandbox from the hypervisor backend, same as
    /// `Hypervisor`; the classification only changes which backend later
    /// receives the pod's container image at `CreateContainer`/`PullImage`.
    pub async fn run_pod_sandbox(&self, config: PodSandboxConfig, unikernel_enabled: bool) -> Result<String> {
        match Self::classify(&config, unikernel_enabled) {
            Backend2::Hypervisor | Backend2::Unikernel => {
                self.hypervisor.sandboxes.run_pod_sandbox(&config).await
            }
            Backend2::Privileged => {
                let privileged = self
                    .privileged
                    .as_ref()
                    .ok_or_else(|| FraktiError::backend_unavailable("privileged", "not configured"))?;
                let id = privileged.sandboxes.run_pod_sandbox(&config).await?;
                self.registry.add(&id, Backend::Privileged).await;
                Ok(id)
            }
        }
    }

    async fn resolve_sandbox_manager(&self, id: &str) -> &SandboxManager {
        match self.registry.get_runtime(id).await {
            Some(Backend::Privileged) => {
                if let Some(p) = &self.privileged {
                    return &p.sandboxes;
                }
                &self.hypervisor.sandboxes
            }
            _ => &self.hypervisor.sandboxes,
        }
    }

    async fn resolve_container_manager(&self, id: &str) -> &ContainerManager {
        match self.registry.get_runtime(id).await {
            Some(Backend::Privileged) => {
                if let Some(p) = &self.privileged {
                    return &p.containers;
                }
                &self.hypervisor.containers
            }
            _ => &self.hypervisor.containers,
        }
    }

    pub async fn stop_pod_sandbox(
        &self,
        id: &str,
        netns_path: &str,
        annotations: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        self.resolve_sandbox_manager(id)
            .await
            .stop_pod_sandbox(id, netns_path, annotations)
            .await
    }

    /// Resolves the netns path needed to stop a sandbox's network: prefers
    /// live backend status, falling back to the checkpoint record (spec
    /// §4.5, "otherwise from the checkpoint") when the backend can't
    /// produce one — the case C10 recovery exists to handle, a sandbox
    /// whose in-memory backend state was lost but whose checkpoint survives.
    /// Annotations aren't part of the checkpoint schema (spec §6), so the
    /// fallback path hands back an empty set.
    pub async fn resolve_stop_target(
        &self,
        id: &str,
    ) -> Result<(String, std::collections::HashMap<String, String>)> {
        match self.pod_sandbox_status(id).await {
            Ok(status) => return Ok((status.net_ns_path, status.annotations)),
            Err(live_err) => {
                if let Ok(blob) = self.checkpoints.get(id).await {
                    if let Ok(checkpoint) = serde_json::from_slice::<crate::types::SandboxCheckpoint>(&blob) {
                        return Ok((checkpoint.netnspath, std::collections::HashMap::new()));
                    }
                }
                Err(live_err)
            }
        }
    }

    pub async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        let result = self.resolve_sandbox_manager(id).await.remove_pod_sandbox(id).await;
        if result.is_ok() {
            self.registry.remove(id, Backend::Privileged).await;
        }
        result
    }

    pub async fn pod_sandbox_status(&self, id: &str) -> Result<Sandbox> {
        self.resolve_sandbox_manager(id).await.pod_sandbox_status(id).await
    }

    /// ListPodSandbox, spec §4.9: fan out sequentially (hypervisor first),
    /// fold in checkpoint-only NOTREADY entries when `filter` is empty.
    pub async fn list_pod_sandbox(&self, filter: &PodSandboxFilter) -> Result<Vec<Sandbox>> {
        let mut all = self.hypervisor.sandboxes.list_pod_sandbox(filter).await?;
        if let Some(privileged) = &self.privileged {
            all.extend(privileged.sandboxes.list_pod_sandbox(filter).await?);
        }

        if filter.id.is_none() && filter.state.is_none() && filter.label_selector.is_empty() {
            let live_ids: HashSet<String> = all.iter().map(|s| s.id.clone()).collect();
            let stubs = recovery::notready_stubs(self.checkpoints.as_ref(), &live_ids).await;
            all.extend(stubs);
        }

        Ok(all)
    }

    pub async fn create_container(
        &self,
        sandbox_id: &str,
        pod_name: &str,
        namespace: &str,
        pod_uid: &str,
        attempt: u32,
        config: &ContainerConfig,
    ) -> Result<String> {
        let backend = self.registry.get_runtime(sandbox_id).await;
        let manager = match backend {
            Some(Backend::Privileged) => {
                &self
                    .privileged
                    .as_ref()
                    .ok_or_else(|| FraktiError::backend_unavailable("privileged", "not configured"))?
                    .containers
            }
            _ => &self.hypervisor.containers,
        };
        let id = manager
            .create_container(sandbox_id, pod_name, namespace, pod_uid, attempt, config)
            .await?;
        if backend == Some(Backend::Privileged) {
            self.registry.add(&id, Backend::Privileged).await;
        }
        Ok(id)
    }

    pub async fn start_container(&self, container_id: &str, sandbox_id: &str) -> Result<()> {
        let backend = self.registry.get_runtime(sandbox_id).await;
        match backend {
            Some(Backend::Privileged) => {
                let p = self
                    .privileged
                    .as_ref()
                    .ok_or_else(|| FraktiError::backend_unavailable("privileged", "not configured"))?;
                p.containers
                    .start_container(container_id, sandbox_id, p.pod_backend.as_ref())
                    .await
            }
            _ => {
                self.hypervisor
                    .containers
                    .start_container(container_id, sandbox_id, self.hypervisor.pod_backend.as_ref())
                    .await
            }
        }
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.resolve_container_manager(id).await.stop_container(id, timeout_secs).await
    }

    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let result = self.resolve_container_manager(id).await.remove_container(id).await;
        if result.is_ok() {
            self.registry.remove(id, Backend::Privileged).await;
        }
        result
    }

    pub async fn container_status(&self, id: &str, mounts: Vec<crate::types::VolumeMount>) -> Result<Container> {
        self.resolve_container_manager(id).await.container_status(id, mounts).await
    }

    pub async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<Container>> {
        let mut all = self.hypervisor.containers.list_containers(filter).await?;
        if let Some(privileged) = &self.privileged {
            all.extend(privileged.containers.list_containers(filter).await?);
        }
        Ok(all)
    }

    /// Version/Status, spec §4.9: always the hypervisor backend for Version;
    /// Status aggregates every backend, failing only on the hypervisor.
    pub async fn version(&self) -> Result<String> {
        self.hypervisor.info.version().await
    }

    pub async fn status(&self) -> Result<bool> {
        let hypervisor_ok = self.hypervisor.info.status_ok().await?;
        if let Some(privileged) = &self.privileged {
            if let Err(e) = privileged.info.status_ok().await {
                log::warn!("privileged backend status check failed: {e}");
            }
        }
        Ok(hypervisor_ok)
    }

    /// ListImages, spec §4.9: intersect hypervisor ∩ privileged by image id,
    /// then append unikernel images verbatim (they never overlap).
    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let hypervisor_images = self.hypervisor.images.list_images().await?;
        let mut result = match &self.privileged {
            Some(privileged) => {
                let privileged_images = privileged.images.list_images().await?;
                intersect_by_id(hypervisor_images, privileged_images)
            }
            None => hypervisor_images,
        };

        if let Some((unikernel_backend, _)) = &self.unikernel {
            result.extend(unikernel_backend.list_images().await?);
        }
        Ok(result)
    }

    /// PullImage, spec §4.9: unikernel refs go only to the unikernel backend;
    /// otherwise pull hypervisor + privileged concurrently (width 2), failing
    /// the whole call if either fails.
    pub async fn pull_image(&self, image_ref: &str) -> Result<String> {
        if let Some((unikernel_backend, prefix)) = &self.unikernel {
            if Self::is_unikernel_image(image_ref, prefix) {
                let manager = ImageManager::new(Arc::clone(unikernel_backend));
                return manager.pull_image(image_ref).await;
            }
        }

        let mut ids = fanout_pull(
            image_ref,
            std::iter::once(&self.hypervisor.images)
                .chain(self.privileged.as_ref().map(|p| &p.images)),
        )
        .await?;
        Ok(ids.remove(0))
    }

    /// RemoveImage, spec §4.9: mirror of `PullImage` — unikernel refs go only
    /// to the unikernel backend; otherwise remove from hypervisor + privileged
    /// concurrently (width 2), failing the whole call if either fails.
    pub async fn remove_image(&self, image_ref: &str) -> Result<()> {
        if let Some((unikernel_backend, prefix)) = &self.unikernel {
            if Self::is_unikernel_image(image_ref, prefix) {
                return unikernel_backend.remove_image(image_ref).await;
            }
        }

        fanout_remove(
            image_ref,
            std::iter::once(&self.hypervisor.images)
                .chain(self.privileged.as_ref().map(|p| &p.images)),
        )
        .await
    }

    /// ImageStatus, spec §4.9: prefer unikernel for unikernel refs, else the
    /// hypervisor backend alone (privileged is assumed to mirror it).
    pub async fn image_status(&self, image_ref: &str) -> Result<Option<ImageInfo>> {
        if let Some((unikernel_backend, prefix)) = &self.unikernel {
            if Self::is_unikernel_image(image_ref, prefix) {
                return unikernel_backend.image_status(image_ref).await;
            }
        }
        self.hypervisor.images.image_status(image_ref).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend2 {
    Hypervisor,
    Privileged,
    Unikernel,
}

fn intersect_by_id(a: Vec<ImageInfo>, b: Vec<ImageInfo>) -> Vec<ImageInfo> {
    let b_ids: HashSet<&str> = b.iter().map(|i| i.id.as_str()).collect();
    a.into_iter()
        .filter(|img| b_ids.contains(img.id.as_str()))
        .map(|img| {
            let other = b.iter().find(|o| o.id == img.id);
            match other {
                Some(other) => ImageInfo {
                    id: img.id,
                    repo_tags: intersect_vec(img.repo_tags, other.repo_tags.clone()),
                    repo_digests: intersect_vec(img.repo_digests, other.repo_digests.clone()),
                    size_bytes: img.size_bytes,
                },
                None => img,
            }
        })
        .collect()
}

fn intersect_vec(a: Vec<String>, b: Vec<String>) -> Vec<String> {
    a.into_iter().filter(|x| b.contains(x)).collect()
}

/// Bounded-width (2) fan-out pull, spec §4.9/§4.9.2 implementation note: every
/// manager in the set must succeed or the whole call fails. With at most two
/// standard backends (hypervisor, privileged) the configured width already
/// covers full concurrency, so each chunk is awaited with `futures_util`'s
/// `join_all` rather than a manually managed task pool.
async fn fanout_pull<'a>(
    image_ref: &str,
    managers: impl Iterator<Item = &'a ImageManager>,
) -> Result<Vec<String>> {
    let managers: Vec<&ImageManager> = managers.collect();
    let mut results = Vec::with_capacity(managers.len());
    for chunk in managers.chunks(IMAGE_FANOUT_WIDTH) {
        let futures = chunk.iter().map(|manager| manager.pull_image(image_ref));
        let chunk_results = futures_util::future::join_all(futures).await;
        for r in chunk_results {
            results.push(r?);
        }
    }
    Ok(results)
}

/// Bounded-width (2) fan-out remove, mirroring `fanout_pull`: every manager
/// in the set must succeed or the whole call fails.
async fn fanout_remove<'a>(
    image_ref: &str,
    managers: impl Iterator<Item = &'a ImageManager>,
) -> Result<()> {
    let managers: Vec<&ImageManager> = managers.collect();
    for chunk in managers.chunks(IMAGE_FANOUT_WIDTH) {
        let futures = chunk.iter().map(|manager| manager.remove_image(image_ref));
        let chunk_results = futures_util::future::join_all(futures).await;
        for r in chunk_results {
            r?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::{FakeBackend, FakeNetworkPlugin};
    use crate::checkpoint::MemCheckpointStore;

    fn hypervisor_handle() -> (BackendHandle, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::new());
        let net = Arc::new(FakeNetworkPlugin);
        let checkpoints = Arc::new(MemCheckpointStore::new());
        let handle = BackendHandle {
            sandboxes: SandboxManager::new(backend.clone(), net, checkpoints),
            containers: ContainerManager::new(backend.clone()),
            images: ImageManager::new(backend.clone()),
            pod_backend: backend.clone(),
            image_backend: backend.clone(),
            info: backend.clone(),
        };
        (handle, backend)
    }

    fn dispatcher() -> Dispatcher {
        let (hypervisor, _) = hypervisor_handle();
        Dispatcher::new(
            Arc::new(RoutingRegistry::new()),
            Arc::new(MemCheckpointStore::new()),
            hypervisor,
            None,
            None,
        )
    }

    #[test]
    fn classification_osccontainer_annotation_is_privileged() {
        let mut config = PodSandboxConfig::default();
        config
            .annotations
            .insert(UNIKERNEL_OSCONTAINER_ANNOTATION.to_string(), "true".to_string());
        assert_eq!(Dispatcher::classify(&config, false), Backend2::Privileged);
    }

    #[test]
    fn classification_host_network_is_privileged() {
        let mut config = PodSandboxConfig::default();
        config.host_network = true;
        assert_eq!(Dispatcher::classify(&config, false), Backend2::Privileged);
    }

    #[test]
    fn classification_unikernel_requires_flag_enabled() {
        let mut config = PodSandboxConfig::default();
        config
            .annotations
            .insert(UNIKERNEL_ANNOTATION.to_string(), "true".to_string());
        assert_eq!(Dispatcher::classify(&config, false), Backend2::Hypervisor);
        assert_eq!(Dispatcher::classify(&config, true), Backend2::Unikernel);
    }

    #[test]
    fn classification_default_is_hypervisor() {
        let config = PodSandboxConfig::default();
        assert_eq!(Dispatcher::classify(&config, true), Backend2::Hypervisor);
    }

    #[test]
    fn unikernel_image_detection() {
        assert!(Dispatcher::is_unikernel_image("unikernel/foo/bar:latest", "unikernel/"));
        assert!(!Dispatcher::is_unikernel_image("busybox:latest", "unikernel/"));
        assert!(!Dispatcher::is_unikernel_image("unikernel/flat", "unikernel/"));
    }

    #[tokio::test]
    async fn run_pod_sandbox_classifies_to_hypervisor_by_default() {
        let d = dispatcher();
        let config = PodSandboxConfig {
            name: "web".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        let id = d.run_pod_sandbox(config, false).await.unwrap();
        assert_eq!(d.registry.get_runtime(&id).await, None);
    }

    #[tokio::test]
    async fn run_pod_sandbox_unikernel_classification_still_creates_on_hypervisor() {
        let d = dispatcher();
        let mut config = PodSandboxConfig {
            name: "web".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        config
            .annotations
            .insert(UNIKERNEL_ANNOTATION.to_string(), "true".to_string());
        assert_eq!(Dispatcher::classify(&config, true), Backend2::Unikernel);

        let id = d.run_pod_sandbox(config, true).await.unwrap();
        let status = d.pod_sandbox_status(&id).await.unwrap();
        assert_eq!(status.id, id);
    }

    #[tokio::test]
    async fn list_images_with_no_privileged_backend_returns_hypervisor_images() {
        let d = dispatcher();
        let images = d.list_images().await.unwrap();
        assert!(images.is_empty());
    }

    fn dispatcher_with_unikernel() -> (Dispatcher, Arc<FakeBackend>) {
        let (hypervisor, _) = hypervisor_handle();
        let unikernel = Arc::new(FakeBackend::new());
        let dispatcher = Dispatcher::new(
            Arc::new(RoutingRegistry::new()),
            Arc::new(MemCheckpointStore::new()),
            hypervisor,
            None,
            Some((unikernel.clone() as Arc<dyn ImageBackend>, "unikernel/".to_string())),
        );
        (dispatcher, unikernel)
    }

    #[tokio::test]
    async fn remove_image_routes_unikernel_prefixed_refs_to_unikernel_backend() {
        let (d, unikernel) = dispatcher_with_unikernel();
        ImageBackend::pull_image(unikernel.as_ref(), "unikernel/app:latest", mpsc::channel(1).0)
            .await
            .unwrap();
        assert!(unikernel.images.lock().unwrap().contains_key("unikernel/app:latest"));

        d.remove_image("unikernel/app:latest").await.unwrap();
        assert!(!unikernel.images.lock().unwrap().contains_key("unikernel/app:latest"));
    }

    #[tokio::test]
    async fn remove_image_fans_out_to_hypervisor_and_privileged() {
        let (hypervisor, hypervisor_backend) = hypervisor_handle();
        let privileged_backend = Arc::new(FakeBackend::new());
        let net = Arc::new(FakeNetworkPlugin);
        let privileged = BackendHandle {
            sandboxes: SandboxManager::new(privileged_backend.clone(), net, Arc::new(MemCheckpointStore::new())),
            containers: ContainerManager::new(privileged_backend.clone()),
            images: ImageManager::new(privileged_backend.clone()),
            pod_backend: privileged_backend.clone(),
            image_backend: privileged_backend.clone(),
            info: privileged_backend.clone(),
        };
        let d = Dispatcher::new(
            Arc::new(RoutingRegistry::new()),
            Arc::new(MemCheckpointStore::new()),
            hypervisor,
            Some(privileged),
            None,
        );

        ImageBackend::pull_image(hypervisor_backend.as_ref(), "busybox:latest", mpsc::channel(1).0)
            .await
            .unwrap();
        ImageBackend::pull_image(privileged_backend.as_ref(), "busybox:latest", mpsc::channel(1).0)
            .await
            .unwrap();

        d.remove_image("busybox:latest").await.unwrap();
        assert!(!hypervisor_backend.images.lock().unwrap().contains_key("busybox:latest"));
        assert!(!privileged_backend.images.lock().unwrap().contains_key("busybox:latest"));
    }

    #[tokio::test]
    async fn list_pod_sandbox_folds_checkpoint_only_notready() {
        let d = dispatcher();
        let blob = serde_json::to_vec(&crate::types::SandboxCheckpoint::new(
            "orphan",
            "default",
            "/var/run/netns/x",
            vec![],
        ))
        .unwrap();
        d.checkpoints.add("orphan-id", &blob).await.unwrap();

        let listed = d.list_pod_sandbox(&PodSandboxFilter::default()).await.unwrap();
        assert!(listed.iter().any(|s| s.id == "orphan-id" && s.state == SandboxState::NotReady));
    }

    #[tokio::test]
    async fn resolve_stop_target_falls_back_to_checkpoint_when_backend_has_no_record() {
        let d = dispatcher();
        let blob = serde_json::to_vec(&crate::types::SandboxCheckpoint::new(
            "orphan",
            "default",
            "/var/run/netns/recovered",
            vec![],
        ))
        .unwrap();
        d.checkpoints.add("recovered-id", &blob).await.unwrap();

        let (netns_path, annotations) = d.resolve_stop_target("recovered-id").await.unwrap();
        assert_eq!(netns_path, "/var/run/netns/recovered");
        assert!(annotations.is_empty());
    }

    #[tokio::test]
    async fn resolve_stop_target_propagates_live_error_with_no_checkpoint() {
        let d = dispatcher();
        let err = d.resolve_stop_target("totally-unknown").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
