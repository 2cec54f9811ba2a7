//! Core data model (spec §3): Sandbox, Container, PortMapping, the sandbox
//! checkpoint schema, and the NetworkInfo handed from C4 to the backend.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which backend a sandbox/container id belongs to. The hypervisor backend is
/// the implicit default and is never itself stored in the Routing Registry
/// (C8) — "absent" is its encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    Privileged,
    Unikernel,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Privileged => "privileged",
            Backend::Unikernel => "unikernel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// `{protocol, containerPort, hostPort}` — stored only in the checkpoint,
/// per §3, to survive process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub container_port: u16,
    pub host_port: u16,
}

/// `{bridgeName, ifName, mac, ip (CIDR), gateway}`, derived once per sandbox
/// from the CNI result. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub bridge_name: String,
    pub if_name: String,
    pub mac: String,
    pub ip: String,
    pub gateway: String,
}

/// A logical isolation unit identified by a server-assigned `SandboxID`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub pod_uid: String,
    pub attempt: u32,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub net_ns_path: String,
    pub state: SandboxState,
    pub created_at_ns: i64,
    pub ip: Option<String>,
    pub owning_backend: Option<Backend>,
}

/// A container, owned by exactly one sandbox.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub sandbox_id: String,
    pub name: String,
    pub attempt: u32,
    pub image: String,
    pub image_ref: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub state: ContainerState,
    pub created_at_ns: i64,
    pub started_at_ns: Option<i64>,
    pub finished_at_ns: Option<i64>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// Shape of the teacher's own `FilesystemUsage` (its `cri.rs`), carried here
/// even though `ImageFsInfo` itself is never populated (spec §9) — the type
/// is what a future backend-reported implementation would return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemUsage {
    pub timestamp_unix_secs: i64,
    pub mountpoint: String,
    pub used_bytes: Option<u64>,
    pub inodes_used: Option<u64>,
}

/// `{schemaVersion:"v1", name, namespace, netNsPath, data:{portMappings:[...]}}`
/// serialized as a JSON blob (spec §3, §6). Written before the backend's start
/// step so a crash mid-start is recoverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxCheckpoint {
    pub version: String,
    pub name: String,
    pub namespace: String,
    pub netnspath: String,
    pub data: CheckpointData,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckpointData {
    pub port_mappings: Vec<PortMapping>,
}

impl SandboxCheckpoint {
    pub const SCHEMA_VERSION: &'static str = "v1";

    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        netnspath: impl Into<String>,
        port_mappings: Vec<PortMapping>,
    ) -> Self {
        Self {
            version: Self::SCHEMA_VERSION.to_string(),
            name: name.into(),
            namespace: namespace.into(),
            netnspath: netnspath.into(),
            data: CheckpointData { port_mappings },
        }
    }
}
