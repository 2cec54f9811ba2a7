//! Container Lifecycle (C6, spec §4.6, §4.6.1): the hypervisor backend's
//! container operations and the Exec/Attach streaming protocol built on top
//! of the Stream Extractor (C2).

use crate::backend::{ContainerBackend, ContainerSpec};
use crate::error::{FraktiError, Result};
use crate::name::{build_container_name, build_labels_with_annotations, get_annotations_from_labels};
use crate::stream::StreamExtractor;
use crate::types::{Container, ContainerState, VolumeMount};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const STDIN_CHUNK_SIZE: usize = 1024;
/// Padding added to the caller's stop timeout before it is handed to the
/// backend's own stop RPC, so the backend always has a chance to report a
/// timeout error itself rather than being cut off by the shim first.
const STOP_TIMEOUT_PADDING_SECS: u64 = 5;
const STOP_TIMEOUT_FLOOR_SECS: u64 = 120;

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
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
    pub mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub id: Option<String>,
    pub sandbox_id: Option<String>,
    pub state: Option<ContainerState>,
    pub label_selector: HashMap<String, String>,
}

fn matches_filter(container: &Container, filter: &ContainerFilter) -> bool {
    if let Some(id) = &filter.id {
        if &container.id != id {
            return false;
        }
    }
    if let Some(sandbox_id) = &filter.sandbox_id {
        if &container.sandbox_id != sandbox_id {
            return false;
        }
    }
    if let Some(state) = filter.state {
        if container.state != state {
            return false;
        }
    }
    filter
        .label_selector
        .iter()
        .all(|(k, v)| container.labels.get(k) == Some(v))
}

pub struct ContainerManager {
    backend: Arc<dyn ContainerBackend>,
}

impl ContainerManager {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }

    /// CreateContainer, spec §4.6: rejected up front when the caller asks for
    /// a privileged container — the hypervisor backend cannot honor it.
    pub async fn create_container(
        &self,
        sandbox_id: &str,
        pod_name: &str,
        namespace: &str,
        pod_uid: &str,
        attempt: u32,
        config: &ContainerConfig,
    ) -> Result<String> {
        if config.privileged {
            return Err(FraktiError::invalid_argument(
                "hypervisor backend cannot run privileged containers",
            ));
        }

        let name = build_container_name(&config.name, pod_name, namespace, pod_uid, attempt);
        let labels = build_labels_with_annotations(&config.labels, &config.annotations);

        let spec = ContainerSpec {
            name,
            image: config.image.clone(),
            working_dir: config.working_dir.clone(),
            tty: config.tty,
            args: config.args.clone(),
            command: config.command.clone(),
            env: config.env.clone(),
            labels,
            privileged: false,
            mounts: config.mounts.clone(),
        };

        self.backend.create_container(sandbox_id, spec).await
    }

    /// StartContainer, spec §4.6: the backend has no per-container start, so
    /// the whole pod is stopped then restarted. This is a documented side
    /// effect (sibling containers restart too), not a bug to silently fix.
    pub async fn start_container(
        &self,
        container_id: &str,
        sandbox_id: &str,
        pod_backend: &dyn crate::backend::PodBackend,
    ) -> Result<()> {
        pod_backend.stop_pod(sandbox_id).await?;
        pod_backend.start_pod(sandbox_id).await?;
        self.backend.start_container(container_id).await
    }

    /// StopContainer, spec §4.6: skip if already not running; pad the
    /// caller's timeout before handing it to the backend.
    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        let info = self.backend.container_info(id).await?;
        if info.state != ContainerState::Running {
            return Ok(());
        }
        let padded = (timeout_secs + STOP_TIMEOUT_PADDING_SECS).max(STOP_TIMEOUT_FLOOR_SECS);
        self.backend.stop_container(id, padded).await
    }

    /// RemoveContainer, spec §4.6: not-found is mapped to success.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        match self.backend.remove_container(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// ListContainers, spec §4.6: one `ContainerInfo` fetch per entry (needed
    /// to recover annotations), filtered on every dimension.
    pub async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<Container>> {
        let infos = self.backend.list_containers().await?;
        let containers: Vec<Container> = infos
            .into_iter()
            .map(|info| Container {
                id: info.id,
                sandbox_id: info.pod_id,
                name: info.name,
                attempt: 0,
                image: info.image,
                image_ref: info.image_ref,
                annotations: get_annotations_from_labels(&info.labels),
                labels: info.labels,
                state: info.state,
                created_at_ns: info.created_at_unix_secs * 1_000_000_000,
                started_at_ns: info.started_at_unix_secs.map(|s| s * 1_000_000_000),
                finished_at_ns: info.finished_at_unix_secs.map(|s| s * 1_000_000_000),
                exit_code: info.exit_code,
                reason: info.reason,
                mounts: vec![],
            })
            .filter(|c| matches_filter(c, filter))
            .collect();
        Ok(containers)
    }

    /// ContainerStatus, spec §4.6: mounts are joined in by the caller (the
    /// dispatcher has the pod-level volume list); this fetch only resolves
    /// the backend-reported fields.
    pub async fn container_status(&self, id: &str, mounts: Vec<VolumeMount>) -> Result<Container> {
        let info = self.backend.container_info(id).await?;
        Ok(Container {
            id: info.id,
            sandbox_id: info.pod_id,
            name: info.name,
            attempt: 0,
            image: info.image,
            image_ref: info.image_ref,
            annotations: get_annotations_from_labels(&info.labels),
            labels: info.labels,
            state: info.state,
            created_at_ns: info.created_at_unix_secs * 1_000_000_000,
            started_at_ns: info.started_at_unix_secs.map(|s| s * 1_000_000_000),
            finished_at_ns: info.finished_at_unix_secs.map(|s| s * 1_000_000_000),
            exit_code: info.exit_code,
            reason: info.reason,
            mounts,
        })
    }

    /// Exec, spec §4.6.1: `ExecCreate` then a bidirectional `ExecStart`
    /// stream driven by two cooperative tasks (stdin writer, stdout/stderr
    /// reader through the Stream Extractor), joined before `Wait`.
    pub async fn exec<R, W1, W2>(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        tty: bool,
        mut stdin: R,
        mut stdout: W1,
        mut stderr: W2,
        timeout_secs: i64,
    ) -> Result<i32>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W1: AsyncWrite + Unpin + Send,
        W2: AsyncWrite + Unpin + Send,
    {
        if timeout_secs < 0 {
            return Err(FraktiError::invalid_argument("exec timeout must not be negative"));
        }

        let body = self.exec_body(container_id, cmd, tty, stdin, stdout, stderr);
        if timeout_secs == 0 {
            return body.await;
        }
        match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs as u64), body).await {
            Ok(result) => result,
            Err(_) => Err(FraktiError::deadline_exceeded(format!(
                "exec on container {container_id} did not finish within {timeout_secs}s"
            ))),
        }
    }

    /// Exec's actual body, split out so `exec` can wrap it in a deadline
    /// (spec §4.6.1: `timeout > 0` maps to an RPC deadline).
    async fn exec_body<R, W1, W2>(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        tty: bool,
        mut stdin: R,
        mut stdout: W1,
        mut stderr: W2,
    ) -> Result<i32>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W1: AsyncWrite + Unpin + Send,
        W2: AsyncWrite + Unpin + Send,
    {
        let exec_id = self.backend.exec_create(container_id, cmd, tty).await?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(16);
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(16);

        let backend = Arc::clone(&self.backend);
        let container_id_owned = container_id.to_string();
        let exec_id_owned = exec_id.clone();
        let stream_task = tokio::spawn(async move {
            backend
                .exec_start(&container_id_owned, &exec_id_owned, stdin_rx, output_tx)
                .await
        });

        let stdin_task = tokio::spawn(async move {
            let mut buf = vec![0u8; STDIN_CHUNK_SIZE];
            loop {
                let n = match stdin.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                if stdin_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        });

        let mut extractor = StreamExtractor::new(tty);
        let drain_task = async {
            while let Some(chunk) = output_rx.recv().await {
                let extracted = extractor.extract(&chunk)?;
                if !extracted.stdout.is_empty() {
                    stdout
                        .write_all(&extracted.stdout)
                        .await
                        .map_err(FraktiError::from)?;
                }
                if !extracted.stderr.is_empty() {
                    stderr
                        .write_all(&extracted.stderr)
                        .await
                        .map_err(FraktiError::from)?;
                }
            }
            Ok::<(), FraktiError>(())
        };

        let (stream_result, drain_result) = tokio::join!(stream_task, drain_task);
        stream_result.map_err(|e| FraktiError::protocol_error(e.to_string()))??;
        drain_result?;
        let _ = stdin_task.await;

        self.backend.wait(container_id, &exec_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::FakeBackend;

    #[tokio::test]
    async fn create_container_rejects_privileged() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = ContainerManager::new(backend);
        let config = ContainerConfig {
            name: "web".into(),
            privileged: true,
            ..Default::default()
        };
        let err = mgr
            .create_container("pod-1", "my-pod", "default", "uid-1", 0, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, FraktiError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn stop_container_skips_when_not_running() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = ContainerManager::new(backend.clone());
        let config = ContainerConfig {
            name: "web".into(),
            ..Default::default()
        };
        let id = mgr
            .create_container("pod-1", "my-pod", "default", "uid-1", 0, &config)
            .await
            .unwrap();
        // freshly created, not started: state is Created, not Running.
        mgr.stop_container(&id, 10).await.unwrap();
    }

    #[tokio::test]
    async fn remove_container_maps_not_found_to_success() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = ContainerManager::new(backend);
        mgr.remove_container("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn exec_rejects_negative_timeout() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = ContainerManager::new(backend);
        let err = mgr
            .exec(
                "ctr-1",
                vec!["true".into()],
                false,
                tokio::io::empty(),
                Vec::new(),
                Vec::new(),
                -1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FraktiError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn exec_enforces_caller_deadline() {
        let backend = Arc::new(FakeBackend::new());
        *backend.stall_exec.lock().unwrap() = true;
        let mgr = ContainerManager::new(backend);
        let err = mgr
            .exec(
                "ctr-1",
                vec!["sleep".into()],
                false,
                tokio::io::empty(),
                Vec::new(),
                Vec::new(),
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FraktiError::DeadlineExceeded { .. }));
    }
}
