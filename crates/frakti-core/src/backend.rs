//! Capability interfaces for the external collaborators named in spec §1 and
//! the Design Notes: `SandboxBackendClient` (hypervisor), `ContainerBackendClient`
//! (privileged/OS-container), `ImageBackendClient` (unikernel, image-only), and
//! `NetworkPlugin` (CNI executor). These are genuinely out of scope — the spec
//! treats their wire protocol as opaque — so they are modeled here as plain
//! `async_trait` capability traits the dispatcher (C9) holds as `Arc<dyn ...>`,
//! which is also what makes the dispatcher testable with fakes (spec §9).

use crate::error::Result;
use crate::types::{ContainerState, NetworkInfo, PortMapping, VolumeMount};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub vcpu: u32,
    pub memory_bytes: u64,
    pub network: Option<NetworkInfo>,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub id: String,
    pub name: String,
    /// Raw phase string as reported by the backend (e.g. `"running"`, `"Running"`, `"failed"`).
    pub phase: String,
    pub pod_ips: Vec<String>,
    pub created_at_unix_secs: i64,
    pub labels: HashMap<String, String>,
    pub net_ns_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub tty: bool,
    pub args: Vec<String>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub privileged: bool,
    pub mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub pod_id: String,
    pub name: String,
    pub image: String,
    pub image_ref: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    pub created_at_unix_secs: i64,
    pub started_at_unix_secs: Option<i64>,
    pub finished_at_unix_secs: Option<i64>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PullProgress {
    Progress { bytes_downloaded: u64 },
    Done,
}

/// Pod lifecycle surface of a backend — shared shape for both the hypervisor
/// (`SandboxBackendClient`) and privileged (`ContainerBackendClient`) backends.
#[async_trait]
pub trait PodBackend: Send + Sync {
    async fn create_pod(&self, spec: PodSpec) -> Result<String>;
    async fn start_pod(&self, id: &str) -> Result<()>;
    /// A backend response code of -2 ("not found") is mapped to success by the caller.
    async fn stop_pod(&self, id: &str) -> Result<()>;
    async fn remove_pod(&self, id: &str) -> Result<()>;
    async fn pod_info(&self, id: &str) -> Result<PodInfo>;
    async fn pod_list(&self) -> Result<Vec<PodInfo>>;
}

/// Container lifecycle + exec/attach surface of a backend.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn create_container(&self, pod_id: &str, spec: ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    async fn container_info(&self, id: &str) -> Result<ContainerInfo>;

    async fn exec_create(&self, container_id: &str, cmd: Vec<String>, tty: bool) -> Result<String>;
    /// Bidirectional stream: `stdin` is drained into the backend process, raw
    /// framed output is pushed onto `output` for the caller's Stream Extractor
    /// (C2) to demultiplex.
    async fn exec_start(
        &self,
        container_id: &str,
        exec_id: &str,
        stdin: mpsc::Receiver<Vec<u8>>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<()>;
    async fn tty_resize(&self, container_id: &str, exec_id: &str, height: u16, width: u16) -> Result<()>;
    async fn wait(&self, container_id: &str, exec_id: &str) -> Result<i32>;
}

/// Image surface of a backend.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;
    /// `Ok(None)` on not-found, per CRI's `ImageStatus` convention (spec §4.7).
    async fn image_status(&self, image_ref: &str) -> Result<Option<ImageInfo>>;
    async fn pull_image(
        &self,
        image_ref: &str,
        progress: mpsc::Sender<PullProgress>,
    ) -> Result<()>;
    async fn remove_image(&self, image_ref: &str) -> Result<()>;
}

/// Version/info surface, used by `Version`/`Status` dispatch rules.
#[async_trait]
pub trait BackendInfo: Send + Sync {
    async fn version(&self) -> Result<String>;
    async fn status_ok(&self) -> Result<bool>;
    /// The cgroup driver the backend itself was started with (spec §7): the
    /// shim compares this against its own configured driver at startup and
    /// refuses to start on a mismatch.
    async fn cgroup_driver(&self) -> Result<crate::config::CgroupDriver>;
}

/// Full capability of the hypervisor backend (pod+container+image+version).
pub trait SandboxBackendClient: PodBackend + ContainerBackend + ImageBackend + BackendInfo {}
impl<T: PodBackend + ContainerBackend + ImageBackend + BackendInfo> SandboxBackendClient for T {}

/// Full capability of the privileged (OS-container) backend — same shape.
pub trait ContainerBackendClient: PodBackend + ContainerBackend + ImageBackend + BackendInfo {}
impl<T: PodBackend + ContainerBackend + ImageBackend + BackendInfo> ContainerBackendClient for T {}

/// Narrower capability of the optional unikernel backend: image operations only.
pub trait ImageBackendClient: ImageBackend {}
impl<T: ImageBackend> ImageBackendClient for T {}

#[derive(Debug, Clone)]
pub struct CniResult {
    pub network: NetworkInfo,
}

/// CNI plugin executor capability (C4's external collaborator).
#[async_trait]
pub trait NetworkPlugin: Send + Sync {
    async fn setup(
        &self,
        netns_path: &str,
        sandbox_id: &str,
        metadata: &HashMap<String, String>,
        annotations: &HashMap<String, String>,
    ) -> Result<CniResult>;
    async fn tear_down(
        &self,
        netns_path: &str,
        sandbox_id: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<()>;
    async fn status(&self) -> Result<()>;
}

#[cfg(test)]
pub mod fakes {
    //! In-memory fakes for the four capability traits, used across the dispatcher
    //! and lifecycle test suites (spec §9's explicit call for testability via fakes).
    use super::*;
    use crate::error::FraktiError;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeBackend {
        pub pods: Mutex<HashMap<String, PodInfo>>,
        pub containers: Mutex<HashMap<String, ContainerInfo>>,
        pub images: Mutex<HashMap<String, ImageInfo>>,
        pub next_id: Mutex<u64>,
        pub fail_start_pod: Mutex<bool>,
        pub stall_exec: Mutex<bool>,
        pub cgroup_driver: Mutex<crate::config::CgroupDriver>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        fn gen_id(&self, prefix: &str) -> String {
            let mut n = self.next_id.lock().unwrap();
            *n += 1;
            format!("{prefix}-{n}")
        }
    }

    #[async_trait]
    impl PodBackend for FakeBackend {
        async fn create_pod(&self, spec: PodSpec) -> Result<String> {
            let id = self.gen_id("pod");
            self.pods.lock().unwrap().insert(
                id.clone(),
                PodInfo {
                    id: id.clone(),
                    name: spec.name,
                    phase: "created".into(),
                    pod_ips: vec![],
                    created_at_unix_secs: 0,
                    labels: spec.labels,
                    net_ns_path: spec
                        .network
                        .map(|n| n.if_name)
                        .unwrap_or_default(),
                },
            );
            Ok(id)
        }

        async fn start_pod(&self, id: &str) -> Result<()> {
            if *self.fail_start_pod.lock().unwrap() {
                return Err(FraktiError::backend_unavailable("fake", "start_pod forced failure"));
            }
            let mut pods = self.pods.lock().unwrap();
            let pod = pods.get_mut(id).ok_or_else(|| FraktiError::not_found(id))?;
            pod.phase = "running".into();
            pod.pod_ips = vec!["10.0.0.5".to_string()];
            Ok(())
        }

        async fn stop_pod(&self, id: &str) -> Result<()> {
            if let Some(pod) = self.pods.lock().unwrap().get_mut(id) {
                pod.phase = "stopped".into();
            }
            Ok(())
        }

        async fn remove_pod(&self, id: &str) -> Result<()> {
            self.pods.lock().unwrap().remove(id);
            Ok(())
        }

        async fn pod_info(&self, id: &str) -> Result<PodInfo> {
            self.pods
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| FraktiError::not_found(id))
        }

        async fn pod_list(&self) -> Result<Vec<PodInfo>> {
            Ok(self.pods.lock().unwrap().values().cloned().collect())
        }
    }

    #[async_trait]
    impl ContainerBackend for FakeBackend {
        async fn create_container(&self, pod_id: &str, spec: ContainerSpec) -> Result<String> {
            let id = self.gen_id("ctr");
            self.containers.lock().unwrap().insert(
                id.clone(),
                ContainerInfo {
                    id: id.clone(),
                    pod_id: pod_id.to_string(),
                    name: spec.name,
                    image: spec.image.clone(),
                    image_ref: spec.image,
                    state: ContainerState::Created,
                    labels: spec.labels,
                    created_at_unix_secs: 0,
                    started_at_unix_secs: None,
                    finished_at_unix_secs: None,
                    exit_code: None,
                    reason: None,
                },
            );
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<()> {
            let mut containers = self.containers.lock().unwrap();
            let c = containers.get_mut(id).ok_or_else(|| FraktiError::not_found(id))?;
            c.state = ContainerState::Running;
            Ok(())
        }

        async fn stop_container(&self, id: &str, _timeout_secs: u64) -> Result<()> {
            if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
                c.state = ContainerState::Exited;
                c.exit_code = Some(0);
            }
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            self.containers.lock().unwrap().remove(id);
            Ok(())
        }

        async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
            Ok(self.containers.lock().unwrap().values().cloned().collect())
        }

        async fn container_info(&self, id: &str) -> Result<ContainerInfo> {
            self.containers
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| FraktiError::not_found(id))
        }

        async fn exec_create(&self, _container_id: &str, _cmd: Vec<String>, _tty: bool) -> Result<String> {
            Ok(self.gen_id("exec"))
        }

        async fn exec_start(
            &self,
            _container_id: &str,
            _exec_id: &str,
            mut stdin: mpsc::Receiver<Vec<u8>>,
            output: mpsc::Sender<Vec<u8>>,
        ) -> Result<()> {
            if *self.stall_exec.lock().unwrap() {
                // Simulates a backend that never returns, so callers can exercise
                // their own deadline handling instead of the backend's.
                std::future::pending::<()>().await;
            }
            while let Some(chunk) = stdin.recv().await {
                let _ = output.send(crate::stream::frame(crate::stream::STREAM_STDOUT, &chunk)).await;
            }
            Ok(())
        }

        async fn tty_resize(&self, _container_id: &str, _exec_id: &str, _height: u16, _width: u16) -> Result<()> {
            Ok(())
        }

        async fn wait(&self, _container_id: &str, _exec_id: &str) -> Result<i32> {
            Ok(0)
        }
    }

    #[async_trait]
    impl ImageBackend for FakeBackend {
        async fn list_images(&self) -> Result<Vec<ImageInfo>> {
            Ok(self.images.lock().unwrap().values().cloned().collect())
        }

        async fn image_status(&self, image_ref: &str) -> Result<Option<ImageInfo>> {
            Ok(self.images.lock().unwrap().get(image_ref).cloned())
        }

        async fn pull_image(&self, image_ref: &str, progress: mpsc::Sender<PullProgress>) -> Result<()> {
            self.images.lock().unwrap().insert(
                image_ref.to_string(),
                ImageInfo {
                    id: image_ref.to_string(),
                    repo_tags: vec![image_ref.to_string()],
                    repo_digests: vec![],
                    size_bytes: 0,
                },
            );
            let _ = progress.send(PullProgress::Done).await;
            Ok(())
        }

        async fn remove_image(&self, image_ref: &str) -> Result<()> {
            self.images.lock().unwrap().remove(image_ref);
            Ok(())
        }
    }

    #[async_trait]
    impl BackendInfo for FakeBackend {
        async fn version(&self) -> Result<String> {
            Ok("fake-0.0.0".to_string())
        }

        async fn status_ok(&self) -> Result<bool> {
            Ok(true)
        }

        async fn cgroup_driver(&self) -> Result<crate::config::CgroupDriver> {
            Ok(*self.cgroup_driver.lock().unwrap())
        }
    }

    #[derive(Default)]
    pub struct FakeNetworkPlugin;

    #[async_trait]
    impl NetworkPlugin for FakeNetworkPlugin {
        async fn setup(
            &self,
            _netns_path: &str,
            _sandbox_id: &str,
            _metadata: &HashMap<String, String>,
            _annotations: &HashMap<String, String>,
        ) -> Result<CniResult> {
            Ok(CniResult {
                network: NetworkInfo {
                    bridge_name: "br-netns".to_string(),
                    if_name: "eth0".to_string(),
                    mac: "52:54:00:00:00:01".to_string(),
                    ip: "10.0.0.5/24".to_string(),
                    gateway: "10.0.0.1".to_string(),
                },
            })
        }

        async fn tear_down(&self, _netns_path: &str, _sandbox_id: &str, _annotations: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }

        async fn status(&self) -> Result<()> {
            Ok(())
        }
    }
}
