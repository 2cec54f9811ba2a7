mod backend;
mod cgroup;
mod checkpoint;
mod config;
mod container;
#[cfg(feature = "cri")]
mod cri;
mod dispatcher;
mod error;
mod image;
mod name;
mod network;
mod recovery;
mod registry;
mod remote;
mod sandbox;
mod stream;
mod types;

pub use backend::{
    BackendInfo, CniResult, ContainerBackend, ContainerBackendClient, ContainerInfo, ContainerSpec,
    ImageBackend, ImageBackendClient, ImageInfo, NetworkPlugin, PodBackend, PodInfo, PodSpec,
    PullProgress, SandboxBackendClient,
};
pub use checkpoint::{CheckpointStore, FsCheckpointStore, MemCheckpointStore};
pub use config::{CgroupDriver, FraktiConfig};
pub use container::{ContainerConfig, ContainerFilter, ContainerManager};
#[cfg(feature = "cri")]
pub use cri::{CriServer, ImageService, RuntimeService};
pub use dispatcher::{BackendHandle, Dispatcher};
pub use error::{FraktiError, Result};
pub use image::ImageManager;
pub use network::CniPluginExecutor;
pub use registry::RoutingRegistry;
pub use remote::{Endpoint, RemoteBackend};
pub use sandbox::{PodSandboxConfig, PodSandboxFilter, SandboxManager};
pub use types::*;

use std::sync::Arc;

/// Top-level daemon handle: owns the wired `Dispatcher` and the configuration
/// it was built from. Backend clients and the CNI plugin are opaque wire
/// collaborators (spec §1, Design Notes §9) and are handed in already built —
/// this crate never dials them itself, the same boundary the teacher draws
/// around its own hypervisor client.
pub struct Frakti {
    config: FraktiConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Frakti {
    /// Wires one hypervisor backend (required), an optional privileged
    /// backend, and an optional unikernel (image-only) backend into a single
    /// `Dispatcher`, then replays startup registry reconciliation (spec
    /// §4.9) so routing survives a restart.
    pub async fn new<H, P, U>(
        config: FraktiConfig,
        hypervisor: Arc<H>,
        network: Arc<dyn NetworkPlugin>,
        privileged: Option<Arc<P>>,
        unikernel: Option<Arc<U>>,
    ) -> Result<Self>
    where
        H: SandboxBackendClient + 'static,
        P: ContainerBackendClient + 'static,
        U: ImageBackendClient + 'static,
    {
        let backend_driver = hypervisor.cgroup_driver().await?;
        if backend_driver != config.cgroup_driver {
            return Err(FraktiError::conflict(format!(
                "configured cgroup driver {:?} does not match hypervisor backend's {:?}",
                config.cgroup_driver, backend_driver
            )));
        }

        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(FsCheckpointStore::new(checkpoint_dir(&config)).await?);
        let registry = Arc::new(RoutingRegistry::new());

        let hypervisor_handle = backend_handle(
            Arc::clone(&hypervisor) as Arc<dyn PodBackend>,
            Arc::clone(&hypervisor) as Arc<dyn ImageBackend>,
            Arc::clone(&hypervisor) as Arc<dyn BackendInfo>,
            Arc::clone(&hypervisor) as Arc<dyn ContainerBackend>,
            Arc::clone(&network),
            Arc::clone(&checkpoints),
        );

        let privileged_handle = privileged.map(|p| {
            backend_handle(
                Arc::clone(&p) as Arc<dyn PodBackend>,
                Arc::clone(&p) as Arc<dyn ImageBackend>,
                Arc::clone(&p) as Arc<dyn BackendInfo>,
                Arc::clone(&p) as Arc<dyn ContainerBackend>,
                Arc::clone(&network),
                Arc::clone(&checkpoints),
            )
        });

        let unikernel_handle = if config.enable_unikernel {
            unikernel.map(|u| {
                let prefix = config.unikernel_prefix_or_default().to_string();
                (u as Arc<dyn ImageBackend>, prefix)
            })
        } else {
            None
        };

        let dispatcher = Dispatcher::new(registry, checkpoints, hypervisor_handle, privileged_handle, unikernel_handle);
        dispatcher.reconcile_registry_on_startup().await?;

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn config(&self) -> &FraktiConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Binds the CRI Unix socket named by `config.listen`. The returned
    /// listener is handed to whatever gRPC transport wraps `RuntimeService`/
    /// `ImageService`; this crate stops at the socket boundary.
    #[cfg(feature = "cri")]
    pub async fn bind(&self) -> Result<tokio::net::UnixListener> {
        CriServer::new(self.config.listen.clone(), Arc::clone(&self.dispatcher))
            .bind()
            .await
    }
}

/// Root handed to `FsCheckpointStore::new`; the store nests sandbox
/// checkpoints under `<root>/sandbox/<sandboxID>` itself (spec §6).
fn checkpoint_dir(config: &FraktiConfig) -> std::path::PathBuf {
    std::path::Path::new(&config.listen)
        .parent()
        .unwrap_or_else(|| std::path::Path::new("/var/run"))
        .join("frakti-checkpoints")
}

fn backend_handle(
    pod_backend: Arc<dyn PodBackend>,
    image_backend: Arc<dyn ImageBackend>,
    info: Arc<dyn BackendInfo>,
    container_backend: Arc<dyn ContainerBackend>,
    network: Arc<dyn NetworkPlugin>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> BackendHandle {
    BackendHandle {
        sandboxes: SandboxManager::new(Arc::clone(&pod_backend), network, checkpoints),
        containers: ContainerManager::new(container_backend),
        images: ImageManager::new(Arc::clone(&image_backend)),
        pod_backend,
        image_backend,
        info,
    }
}
