//! CRI surface (spec §6, §9): the Kubernetes CRI v1alpha2 Runtime and Image
//! services, modeled — per the Design Notes — as plain `(request, response)`
//! message structs plus `async_trait` service traits rather than generated
//! protobuf stubs; stub generation is left to whichever gRPC framework wraps
//! this crate. `CriServer` binds the configured Unix socket the same way the
//! teacher's `CriServer::serve` does: unlink a stale socket file, then bind.

#![cfg(feature = "cri")]

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct PodSandboxConfigRequest {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub attempt: u32,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub cgroup_parent: String,
    pub port_mappings: Vec<crate::types::PortMapping>,
    pub security_privileged: bool,
    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,
}

impl From<PodSandboxConfigRequest> for crate::sandbox::PodSandboxConfig {
    fn from(r: PodSandboxConfigRequest) -> Self {
        crate::sandbox::PodSandboxConfig {
            name: r.name,
            namespace: r.namespace,
            uid: r.uid,
            attempt: r.attempt,
            hostname: r.hostname,
            labels: r.labels,
            annotations: r.annotations,
            cgroup_parent: r.cgroup_parent,
            port_mappings: r.port_mappings,
            security_privileged: r.security_privileged,
            host_network: r.host_network,
            host_pid: r.host_pid,
            host_ipc: r.host_ipc,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerConfigRequest {
    pub name: String,
    pub image: String,
    pub image_ref: String,
    pub working_dir: String,
    pub tty: bool,
    pub args: Vec<String>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub privileged: bool,
    pub mounts: Vec<crate::types::VolumeMount>,
}

impl From<ContainerConfigRequest> for crate::container::ContainerConfig {
    fn from(r: ContainerConfigRequest) -> Self {
        crate::container::ContainerConfig {
            name: r.name,
            image: r.image,
            image_ref: r.image_ref,
            working_dir: r.working_dir,
            tty: r.tty,
            args: r.args,
            command: r.command,
            env: r.env,
            labels: r.labels,
            annotations: r.annotations,
            privileged: r.privileged,
            mounts: r.mounts,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VersionResponse {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

#[derive(Debug, Clone, Default)]
pub struct StatusResponse {
    pub ready: bool,
}

/// Runtime RPCs (spec §4.9's method table). Every method maps 1:1 onto a
/// `Dispatcher` call; the only translation here is request/response shaping.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn version(&self) -> Result<VersionResponse>;
    async fn run_pod_sandbox(&self, config: PodSandboxConfigRequest, unikernel_enabled: bool) -> Result<String>;
    async fn stop_pod_sandbox(&self, id: &str) -> Result<()>;
    async fn remove_pod_sandbox(&self, id: &str) -> Result<()>;
    async fn pod_sandbox_status(&self, id: &str) -> Result<crate::types::Sandbox>;
    async fn list_pod_sandbox(&self, filter: crate::sandbox::PodSandboxFilter) -> Result<Vec<crate::types::Sandbox>>;
    async fn create_container(
        &self,
        sandbox_id: &str,
        pod_name: &str,
        namespace: &str,
        pod_uid: &str,
        attempt: u32,
        config: ContainerConfigRequest,
    ) -> Result<String>;
    async fn start_container(&self, container_id: &str, sandbox_id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn container_status(&self, id: &str) -> Result<crate::types::Container>;
    async fn list_containers(&self, filter: crate::container::ContainerFilter) -> Result<Vec<crate::types::Container>>;
    async fn status(&self) -> Result<StatusResponse>;
}

/// Image RPCs.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn list_images(&self) -> Result<Vec<crate::backend::ImageInfo>>;
    async fn image_status(&self, image_ref: &str) -> Result<Option<crate::backend::ImageInfo>>;
    async fn pull_image(&self, image_ref: &str) -> Result<String>;
    async fn remove_image(&self, image_ref: &str) -> Result<()>;
    /// Deliberately unimplemented (spec §9): no backend capability surfaces
    /// filesystem usage, so this always returns `FraktiError::Unimplemented`,
    /// mapped by the gRPC layer to CRI's `UNIMPLEMENTED` status.
    async fn image_fs_info(&self) -> Result<Vec<crate::types::FilesystemUsage>>;
}

#[async_trait]
impl RuntimeService for Dispatcher {
    async fn version(&self) -> Result<VersionResponse> {
        let version = Dispatcher::version(self).await?;
        Ok(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "frakti".to_string(),
            runtime_version: version,
            runtime_api_version: "v1alpha2".to_string(),
        })
    }

    async fn run_pod_sandbox(&self, config: PodSandboxConfigRequest, unikernel_enabled: bool) -> Result<String> {
        Dispatcher::run_pod_sandbox(self, config.into(), unikernel_enabled).await
    }

    async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        let (net_ns_path, annotations) = Dispatcher::resolve_stop_target(self, id).await?;
        Dispatcher::stop_pod_sandbox(self, id, &net_ns_path, &annotations).await
    }

    async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        Dispatcher::remove_pod_sandbox(self, id).await
    }

    async fn pod_sandbox_status(&self, id: &str) -> Result<crate::types::Sandbox> {
        Dispatcher::pod_sandbox_status(self, id).await
    }

    async fn list_pod_sandbox(&self, filter: crate::sandbox::PodSandboxFilter) -> Result<Vec<crate::types::Sandbox>> {
        Dispatcher::list_pod_sandbox(self, &filter).await
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        pod_name: &str,
        namespace: &str,
        pod_uid: &str,
        attempt: u32,
        config: ContainerConfigRequest,
    ) -> Result<String> {
        Dispatcher::create_container(self, sandbox_id, pod_name, namespace, pod_uid, attempt, &config.into()).await
    }

    async fn start_container(&self, container_id: &str, sandbox_id: &str) -> Result<()> {
        Dispatcher::start_container(self, container_id, sandbox_id).await
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        Dispatcher::stop_container(self, id, timeout_secs).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        Dispatcher::remove_container(self, id).await
    }

    async fn container_status(&self, id: &str) -> Result<crate::types::Container> {
        Dispatcher::container_status(self, id, vec![]).await
    }

    async fn list_containers(&self, filter: crate::container::ContainerFilter) -> Result<Vec<crate::types::Container>> {
        Dispatcher::list_containers(self, &filter).await
    }

    async fn status(&self) -> Result<StatusResponse> {
        let ready = Dispatcher::status(self).await?;
        Ok(StatusResponse { ready })
    }
}

#[async_trait]
impl ImageService for Dispatcher {
    async fn list_images(&self) -> Result<Vec<crate::backend::ImageInfo>> {
        Dispatcher::list_images(self).await
    }

    async fn image_status(&self, image_ref: &str) -> Result<Option<crate::backend::ImageInfo>> {
        Dispatcher::image_status(self, image_ref).await
    }

    async fn pull_image(&self, image_ref: &str) -> Result<String> {
        Dispatcher::pull_image(self, image_ref).await
    }

    async fn remove_image(&self, image_ref: &str) -> Result<()> {
        Dispatcher::remove_image(self, image_ref).await
    }

    async fn image_fs_info(&self) -> Result<Vec<crate::types::FilesystemUsage>> {
        Err(crate::error::FraktiError::unimplemented("ImageFsInfo"))
    }
}

/// Binds the CRI Unix socket. Unlinks a stale socket file first, same
/// preamble as the teacher's `CriServer::serve`.
pub struct CriServer {
    socket_path: String,
    dispatcher: Arc<Dispatcher>,
}

impl CriServer {
    pub fn new(socket_path: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            socket_path: socket_path.into(),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Unlinks a stale socket at `socket_path`, then binds a fresh
    /// `UnixListener`. Actual gRPC codec/transport wiring (the `tonic`
    /// service glue around `RuntimeService`/`ImageService`) is left to the
    /// embedder, consistent with this module modeling the CRI surface as
    /// request/response schemas rather than generated stubs.
    pub async fn bind(&self) -> Result<tokio::net::UnixListener> {
        if std::path::Path::new(&self.socket_path).exists() {
            std::fs::remove_file(&self.socket_path).map_err(crate::error::FraktiError::from)?;
        }
        tokio::net::UnixListener::bind(&self.socket_path).map_err(crate::error::FraktiError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::{FakeBackend, FakeNetworkPlugin};
    use crate::checkpoint::{CheckpointStore, MemCheckpointStore};
    use crate::dispatcher::BackendHandle;
    use crate::registry::RoutingRegistry;

    fn test_dispatcher() -> Dispatcher {
        test_dispatcher_with_checkpoints().0
    }

    fn test_dispatcher_with_checkpoints() -> (Dispatcher, Arc<MemCheckpointStore>) {
        let backend = Arc::new(FakeBackend::new());
        let net = Arc::new(FakeNetworkPlugin);
        let checkpoints = Arc::new(MemCheckpointStore::new());
        let hypervisor = BackendHandle {
            sandboxes: crate::sandbox::SandboxManager::new(backend.clone(), net, checkpoints.clone()),
            containers: crate::container::ContainerManager::new(backend.clone()),
            images: crate::image::ImageManager::new(backend.clone()),
            pod_backend: backend.clone(),
            image_backend: backend.clone(),
            info: backend.clone(),
        };
        let dispatcher = Dispatcher::new(
            Arc::new(RoutingRegistry::new()),
            checkpoints.clone() as Arc<dyn crate::checkpoint::CheckpointStore>,
            hypervisor,
            None,
            None,
        );
        (dispatcher, checkpoints)
    }

    #[tokio::test]
    async fn run_pod_sandbox_then_status_round_trips_through_the_service_trait() {
        let dispatcher = test_dispatcher();
        let request = PodSandboxConfigRequest {
            name: "web".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        let id = RuntimeService::run_pod_sandbox(&dispatcher, request, false).await.unwrap();
        let status = RuntimeService::pod_sandbox_status(&dispatcher, &id).await.unwrap();
        assert_eq!(status.id, id);
    }

    #[tokio::test]
    async fn bind_unlinks_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("frakti.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let dispatcher = Arc::new(test_dispatcher());
        let server = CriServer::new(socket_path.to_string_lossy().into_owned(), dispatcher);
        let _listener = server.bind().await.unwrap();
    }

    #[tokio::test]
    async fn stop_pod_sandbox_recovers_netns_from_checkpoint_when_backend_forgot_it() {
        let (dispatcher, checkpoints) = test_dispatcher_with_checkpoints();
        let blob = serde_json::to_vec(&crate::types::SandboxCheckpoint::new(
            "web",
            "default",
            "/var/run/netns/recovered",
            vec![],
        ))
        .unwrap();
        checkpoints.add("recovered-id", &blob).await.unwrap();

        RuntimeService::stop_pod_sandbox(&dispatcher, "recovered-id").await.unwrap();
    }

    #[tokio::test]
    async fn image_fs_info_is_deliberately_unimplemented() {
        let dispatcher = test_dispatcher();
        let err = ImageService::image_fs_info(&dispatcher).await.unwrap_err();
        assert!(matches!(err, crate::error::FraktiError::Unimplemented { .. }));
    }
}
