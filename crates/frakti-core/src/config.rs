//! Configuration (C11, spec §1A, §6): `FraktiConfig` is built once from
//! parsed CLI flags and threaded explicitly through constructors, matching
//! the teacher's `RuntimeConfig::from_env()`/`new_with_config()` pattern in
//! `lib.rs` — no process-wide config global.

#[derive(Debug, Clone)]
pub struct FraktiConfig {
    /// Unix socket path the CRI server binds to.
    pub listen: String,
    /// `host:port` of the hypervisor backend's gRPC endpoint.
    pub hyper_endpoint: String,
    pub streaming_server_addr: String,
    pub streaming_server_port: u16,
    pub cni_net_dir: String,
    pub cni_plugin_dir: String,
    /// Privileged backend endpoint (unix socket URI); `None` disables it.
    pub docker_endpoint: Option<String>,
    pub enable_alternative_runtime: bool,
    pub cgroup_driver: CgroupDriver,
    pub unikernel_prefix: Option<String>,
    pub enable_unikernel: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum CgroupDriver {
    #[default]
    Cgroupfs,
    Systemd,
}

impl Default for FraktiConfig {
    fn default() -> Self {
        Self {
            listen: "/var/run/frakti.sock".to_string(),
            hyper_endpoint: "127.0.0.1:22318".to_string(),
            streaming_server_addr: "0.0.0.0".to_string(),
            streaming_server_port: 10250,
            cni_net_dir: "/etc/cni/net.d".to_string(),
            cni_plugin_dir: "/opt/cni/bin".to_string(),
            docker_endpoint: None,
            enable_alternative_runtime: false,
            cgroup_driver: CgroupDriver::Cgroupfs,
            unikernel_prefix: None,
            enable_unikernel: false,
            verbose: false,
        }
    }
}

impl FraktiConfig {
    pub fn unikernel_prefix_or_default(&self) -> &str {
        self.unikernel_prefix.as_deref().unwrap_or("unikernel/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_disables_alternative_backends() {
        let config = FraktiConfig::default();
        assert!(!config.enable_alternative_runtime);
        assert!(!config.enable_unikernel);
        assert!(config.docker_endpoint.is_none());
    }

    #[test]
    fn unikernel_prefix_falls_back_when_unset() {
        let config = FraktiConfig::default();
        assert_eq!(config.unikernel_prefix_or_default(), "unikernel/");
    }
}
