//! Sandbox Lifecycle (C5, spec §4.5): the hypervisor backend's `RunPodSandbox`
//! family. Owns the checkpoint-before-start invariant and the CNI/netns
//! failure-teardown chain; classification and cross-backend fan-out live one
//! level up, in the dispatcher (C9).

use crate::backend::{NetworkPlugin, PodBackend, PodSpec};
use crate::cgroup;
use crate::checkpoint::CheckpointStore;
use crate::error::{FraktiError, Result};
use crate::name::{build_labels_with_annotations, build_sandbox_name, get_annotations_from_labels, parse_name};
use crate::network;
use crate::types::{PortMapping, Sandbox, SandboxCheckpoint, SandboxState};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct PodSandboxConfig {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub attempt: u32,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub cgroup_parent: String,
    pub port_mappings: Vec<PortMapping>,
    /// Security-context fields used only for backend classification (§4.9.1);
    /// the hypervisor/privileged lifecycle itself ignores them.
    pub security_privileged: bool,
    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PodSandboxFilter {
    pub id: Option<String>,
    pub state: Option<SandboxState>,
    pub label_selector: HashMap<String, String>,
}

fn matches_filter(sandbox: &Sandbox, filter: &PodSandboxFilter) -> bool {
    if let Some(id) = &filter.id {
        if &sandbox.id != id {
            return false;
        }
    }
    if let Some(state) = filter.state {
        if sandbox.state != state {
            return false;
        }
    }
    filter
        .label_selector
        .iter()
        .all(|(k, v)| sandbox.labels.get(k) == Some(v))
}

/// Runs the hypervisor backend's pod sandbox lifecycle against one backend
/// client, one network plugin, and the shared checkpoint store.
pub struct SandboxManager {
    backend: Arc<dyn PodBackend>,
    network: Arc<dyn NetworkPlugin>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl SandboxManager {
    pub fn new(
        backend: Arc<dyn PodBackend>,
        network: Arc<dyn NetworkPlugin>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            backend,
            network,
            checkpoints,
        }
    }

    /// RunPodSandbox, spec §4.5: cgroup sizing, CNI + relay bridge, then a
    /// checkpoint write *before* the backend is asked to create/start.
    pub async fn run_pod_sandbox(&self, config: &PodSandboxConfig) -> Result<String> {
        let vcpu = cgroup::read_cpu_metrics(&config.cgroup_parent);
        let memory_bytes = cgroup::read_memory_metrics(&config.cgroup_parent);

        let sandbox_net = network::setup_sandbox_network(
            self.network.as_ref(),
            &config.name,
            &config.labels,
            &config.annotations,
        )
        .await?;

        let sandbox_name = build_sandbox_name(&config.name, &config.namespace, &config.uid, config.attempt);
        let merged_labels = build_labels_with_annotations(&config.labels, &config.annotations);

        let spec = PodSpec {
            name: sandbox_name,
            hostname: config.hostname.clone(),
            labels: merged_labels,
            vcpu,
            memory_bytes,
            network: Some(sandbox_net.info.clone()),
            port_mappings: config.port_mappings.clone(),
        };

        let checkpoint = SandboxCheckpoint::new(
            config.name.clone(),
            config.namespace.clone(),
            sandbox_net.netns_path.clone(),
            config.port_mappings.clone(),
        );
        let blob = serde_json::to_vec(&checkpoint)?;

        // Stage an id-less checkpoint key first is not possible (the id comes
        // from CreatePod); instead we checkpoint once the id is known but
        // still strictly before StartPod, matching the "before start" contract.
        let id = match self.backend.create_pod(spec).await {
            Ok(id) => id,
            Err(e) => {
                network::teardown_sandbox_network(
                    self.network.as_ref(),
                    &config.name,
                    &sandbox_net.netns_path,
                    &sandbox_net.info.if_name,
                    None,
                    &config.annotations,
                )
                .await;
                return Err(e);
            }
        };
        self.checkpoints.add(&id, &blob).await?;

        if let Err(e) = self.backend.start_pod(&id).await {
            let _ = self.backend.remove_pod(&id).await;
            network::teardown_sandbox_network(
                self.network.as_ref(),
                &config.name,
                &sandbox_net.netns_path,
                &sandbox_net.info.if_name,
                None,
                &config.annotations,
            )
            .await;
            let _ = self.checkpoints.delete(&id).await;
            return Err(e);
        }

        Ok(id)
    }

    /// StopPodSandbox, spec §4.5: stop the backend pod, tear down CNI/netns.
    /// The checkpoint is intentionally **not** removed.
    pub async fn stop_pod_sandbox(&self, id: &str, netns_path: &str, annotations: &HashMap<String, String>) -> Result<()> {
        match self.backend.stop_pod(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        network::teardown_sandbox_network(
            self.network.as_ref(),
            id,
            netns_path,
            "",
            None,
            annotations,
        )
        .await;
        Ok(())
    }

    /// RemovePodSandbox, spec §4.5: backend remove (not-found maps to
    /// success) and checkpoint delete are both attempted; both are required
    /// for a fully clean removal but each succeeds independently.
    pub async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        match self.backend.remove_pod(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.checkpoints.delete(id).await
    }

    /// PodSandboxStatus, spec §4.5.
    pub async fn pod_sandbox_status(&self, id: &str) -> Result<Sandbox> {
        let info = self.backend.pod_info(id).await?;
        let state = match info.phase.as_str() {
            "running" | "Running" => SandboxState::Ready,
            _ => SandboxState::NotReady,
        };
        let parsed = parse_name(&info.name).ok();
        let annotations = get_annotations_from_labels(&info.labels);

        Ok(Sandbox {
            id: info.id,
            name: parsed.as_ref().map(|p| p.pod_name.clone()).unwrap_or(info.name),
            namespace: parsed.as_ref().map(|p| p.namespace.clone()).unwrap_or_default(),
            pod_uid: parsed.map(|p| p.pod_uid).unwrap_or_default(),
            attempt: 0,
            labels: info.labels,
            annotations,
            net_ns_path: info.net_ns_path,
            state,
            created_at_ns: info.created_at_unix_secs * 1_000_000_000,
            ip: info.pod_ips.into_iter().next(),
            owning_backend: None,
        })
    }

    /// ListPodSandbox, spec §4.5: live listing filtered, newest-first by
    /// createdAt. Checkpoint-only NOTREADY folding is the dispatcher's job
    /// (it needs a view across every backend, see `recovery::notready_stubs`).
    pub async fn list_pod_sandbox(&self, filter: &PodSandboxFilter) -> Result<Vec<Sandbox>> {
        let infos = self.backend.pod_list().await?;
        let mut sandboxes: Vec<Sandbox> = infos
            .into_iter()
            .map(|info| {
                let state = match info.phase.as_str() {
                    "running" | "Running" => SandboxState::Ready,
                    _ => SandboxState::NotReady,
                };
                let parsed = parse_name(&info.name).ok();
                let annotations = get_annotations_from_labels(&info.labels);
                Sandbox {
                    id: info.id,
                    name: parsed.as_ref().map(|p| p.pod_name.clone()).unwrap_or(info.name),
                    namespace: parsed.as_ref().map(|p| p.namespace.clone()).unwrap_or_default(),
                    pod_uid: parsed.map(|p| p.pod_uid).unwrap_or_default(),
                    attempt: 0,
                    labels: info.labels,
                    annotations,
                    net_ns_path: info.net_ns_path,
                    state,
                    created_at_ns: info.created_at_unix_secs * 1_000_000_000,
                    ip: info.pod_ips.into_iter().next(),
                    owning_backend: None,
                }
            })
            .filter(|s| matches_filter(s, filter))
            .collect();

        sandboxes.sort_by(|a, b| b.created_at_ns.cmp(&a.created_at_ns));
        Ok(sandboxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::{FakeBackend, FakeNetworkPlugin};
    use crate::checkpoint::MemCheckpointStore;

    fn manager() -> (SandboxManager, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::new());
        let net = Arc::new(FakeNetworkPlugin);
        let checkpoints = Arc::new(MemCheckpointStore::new());
        (
            SandboxManager::new(backend.clone(), net, checkpoints),
            backend,
        )
    }

    #[tokio::test]
    async fn run_pod_sandbox_checkpoints_before_returning() {
        let (mgr, _backend) = manager();
        let config = PodSandboxConfig {
            name: "web".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        let id = mgr.run_pod_sandbox(&config).await.unwrap();
        assert!(mgr.checkpoints.get(&id).await.is_ok());
    }

    #[tokio::test]
    async fn failed_start_rolls_back_pod_and_checkpoint() {
        let (mgr, backend) = manager();
        *backend.fail_start_pod.lock().unwrap() = true;

        let config = PodSandboxConfig {
            name: "web".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        let err = mgr.run_pod_sandbox(&config).await.unwrap_err();
        assert!(matches!(err, FraktiError::BackendUnavailable { .. }));
        assert!(backend.pods.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_pod_sandbox_filters_by_label() {
        let (mgr, _backend) = manager();
        let mut config = PodSandboxConfig {
            name: "web".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        config.labels.insert("tier".into(), "frontend".into());
        mgr.run_pod_sandbox(&config).await.unwrap();

        let mut filter = PodSandboxFilter::default();
        filter.label_selector.insert("tier".into(), "backend".into());
        let listed = mgr.list_pod_sandbox(&filter).await.unwrap();
        assert!(listed.is_empty());
    }
}
