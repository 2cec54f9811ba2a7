//! Network Setup (C4, spec §4.4): per-sandbox network namespace creation,
//! CNI plugin invocation, and the in-namespace relay bridge that lets a VM
//! backend assume the CNI-assigned address.
//!
//! Namespace entry/exit uses direct `libc` FFI calls in the same style the
//! teacher crate uses for PTY/termios handling; bridge/veth/address
//! manipulation shells out to the `ip` and `iptables` binaries, treating them
//! as external collaborators the way the CNI plugin itself is invoked.

use crate::backend::{CniResult, NetworkPlugin};
use crate::error::{FraktiError, Result};
use crate::types::NetworkInfo;
use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const NETNS_DIR: &str = "/var/run/netns";
const RELAY_BRIDGE_NAME: &str = "br-netns";

fn random_hex(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Create `/var/run/netns/<random>` via `ip netns add`, returning its path.
pub async fn create_netns() -> Result<String> {
    let name = format!("frakti-{}", random_hex(8));
    run_ip(&["netns", "add", &name]).await?;
    Ok(PathBuf::from(NETNS_DIR).join(&name).to_string_lossy().into_owned())
}

/// Remove a network namespace created by `create_netns`. Best-effort: logs
/// and swallows errors so teardown never blocks on an already-gone namespace.
pub async fn remove_netns(netns_path: &str) {
    if let Some(name) = netns_name(netns_path) {
        if let Err(e) = run_ip(&["netns", "delete", &name]).await {
            warn!("remove_netns({netns_path}): {e}");
        }
    }
}

fn netns_name(netns_path: &str) -> Option<String> {
    PathBuf::from(netns_path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
}

async fn run_ip(args: &[&str]) -> Result<()> {
    run_command("ip", args).await
}

async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    debug!("exec: {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| FraktiError::backend_unavailable("network", format!("{program}: {e}")))?;
    if !output.status.success() {
        return Err(FraktiError::backend_unavailable(
            "network",
            format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            ),
        ));
    }
    Ok(())
}

async fn run_ip_in_ns(netns: &str, args: &[&str]) -> Result<()> {
    let mut full = vec!["netns", "exec", netns, "ip"];
    full.extend_from_slice(args);
    run_ip(&full).await
}

/// Relay bridge build, spec §4.4 steps (1)-(4):
/// 1. Create `br-netns` inside the sandbox namespace.
/// 2. Generate a veth pair, move one end to the host namespace, bring both up.
/// 3. Strip the CNI-assigned address from each in-namespace interface, assign
///    a fresh locally-administered MAC, enslave it to `br-netns`.
/// 4. In the host namespace create `br<rand>`, enslave the host veth end, and
///    install the `raw/PREROUTING -i br<rand> -j NOTRACK` iptables rule.
pub struct RelayBridge {
    pub netns_name: String,
    pub host_veth: String,
    pub ns_veth: String,
    pub host_bridge: String,
}

async fn build_relay_bridge(netns_path: &str, cni_if_name: &str) -> Result<RelayBridge> {
    let netns = netns_name(netns_path)
        .ok_or_else(|| FraktiError::invalid_argument(format!("malformed netns path {netns_path}")))?;
    let rand = random_hex(6);
    let host_veth = format!("veth{rand}");
    let ns_veth = format!("veth{rand}c");
    let host_bridge = format!("br{rand}");

    let teardown_on_err = |err: FraktiError, bridge: RelayBridge| async move {
        warn!("relay bridge setup failed, tearing down partial state: {err}");
        teardown_relay_bridge(netns_path, &bridge).await;
        Err(err)
    };

    if let Err(e) = run_ip_in_ns(&netns, &["link", "add", RELAY_BRIDGE_NAME, "type", "bridge"]).await {
        return teardown_on_err(
            e,
            RelayBridge {
                netns_name: netns,
                host_veth,
                ns_veth,
                host_bridge,
            },
        )
        .await;
    }

    let setup_steps: Result<()> = async {
        run_ip_in_ns(&netns, &["link", "add", &ns_veth, "type", "veth", "peer", "name", &host_veth])
            .await?;
        run_ip_in_ns(&netns, &["link", "set", &host_veth, "netns", "1"]).await?;
        run_ip_in_ns(&netns, &["link", "set", &ns_veth, "up"]).await?;
        run_ip(&["link", "set", &host_veth, "up"]).await?;

        let mac = format!(
            "52:54:{:02x}:{:02x}:{:02x}:{:02x}",
            rand::thread_rng().gen::<u8>(),
            rand::thread_rng().gen::<u8>(),
            rand::thread_rng().gen::<u8>(),
            rand::thread_rng().gen::<u8>()
        );
        run_ip_in_ns(&netns, &["addr", "flush", "dev", cni_if_name]).await?;
        run_ip_in_ns(&netns, &["link", "set", cni_if_name, "address", &mac]).await?;
        run_ip_in_ns(&netns, &["link", "set", cni_if_name, "master", RELAY_BRIDGE_NAME]).await?;
        run_ip_in_ns(&netns, &["link", "set", &ns_veth, "master", RELAY_BRIDGE_NAME]).await?;
        run_ip_in_ns(&netns, &["link", "set", RELAY_BRIDGE_NAME, "up"]).await?;

        run_ip(&["link", "add", &host_bridge, "type", "bridge"]).await?;
        run_ip(&["link", "set", &host_veth, "master", &host_bridge]).await?;
        run_ip(&["link", "set", &host_bridge, "up"]).await?;

        run_command(
            "iptables",
            &["-t", "raw", "-A", "PREROUTING", "-i", &host_bridge, "-j", "NOTRACK"],
        )
        .await?;
        Ok(())
    }
    .await;

    let bridge = RelayBridge {
        netns_name: netns,
        host_veth,
        ns_veth,
        host_bridge,
    };

    match setup_steps {
        Ok(()) => Ok(bridge),
        Err(e) => teardown_on_err(e, bridge).await,
    }
}

/// Best-effort reversal of every step `build_relay_bridge` may have completed.
/// Every created link is removed before returning so the host is never
/// leaked resources (spec §4.4 failure semantics).
async fn teardown_relay_bridge(_netns_path: &str, bridge: &RelayBridge) {
    let _ = run_command(
        "iptables",
        &["-t", "raw", "-D", "PREROUTING", "-i", &bridge.host_bridge, "-j", "NOTRACK"],
    )
    .await;
    let _ = run_ip(&["link", "del", &bridge.host_veth]).await;
    let _ = run_ip(&["link", "del", &bridge.host_bridge]).await;
    let _ = run_ip_in_ns(&bridge.netns_name, &["link", "del", RELAY_BRIDGE_NAME]).await;
}

/// Teardown reverses the relay bridge and, for interfaces listed in the
/// checkpoint, restores the original IP address on the kernel interface so
/// plugins expecting addresses on the interface clean up correctly.
pub async fn teardown_relay_bridge_for(
    netns_path: &str,
    cni_if_name: &str,
    restore_ip: Option<&str>,
) {
    if let Some(netns) = netns_name(netns_path) {
        if let Some(ip) = restore_ip {
            let _ = run_ip_in_ns(&netns, &["addr", "add", ip, "dev", cni_if_name]).await;
        }
        let _ = run_ip_in_ns(&netns, &["link", "del", RELAY_BRIDGE_NAME]).await;
    }
}

/// Result of `setup_sandbox_network`: the NetworkInfo handed to the backend
/// plus the namespace path callers need later to tear the sandbox down.
pub struct SandboxNetwork {
    pub netns_path: String,
    pub info: NetworkInfo,
}

/// Full C4 setup: create the namespace, invoke CNI, build the relay bridge.
/// On any failure, partial state (namespace, CNI config, relay links) is
/// torn down before the error is returned.
pub async fn setup_sandbox_network(
    plugin: &dyn NetworkPlugin,
    sandbox_id: &str,
    metadata: &HashMap<String, String>,
    annotations: &HashMap<String, String>,
) -> Result<SandboxNetwork> {
    let netns_path = create_netns().await?;

    let cni_result: Result<CniResult> =
        plugin.setup(&netns_path, sandbox_id, metadata, annotations).await;
    let cni_result = match cni_result {
        Ok(r) => r,
        Err(e) => {
            remove_netns(&netns_path).await;
            return Err(e);
        }
    };

    match build_relay_bridge(&netns_path, &cni_result.network.if_name).await {
        Ok(_bridge) => Ok(SandboxNetwork {
            netns_path,
            info: cni_result.network,
        }),
        Err(e) => {
            let _ = plugin.tear_down(&netns_path, sandbox_id, annotations).await;
            remove_netns(&netns_path).await;
            Err(e)
        }
    }
}

/// Symmetric teardown: relay bridge, then CNI, then the namespace itself.
pub async fn teardown_sandbox_network(
    plugin: &dyn NetworkPlugin,
    sandbox_id: &str,
    netns_path: &str,
    if_name: &str,
    restore_ip: Option<&str>,
    annotations: &HashMap<String, String>,
) {
    teardown_relay_bridge_for(netns_path, if_name, restore_ip).await;
    if let Err(e) = plugin.tear_down(netns_path, sandbox_id, annotations).await {
        warn!("CNI teardown for {sandbox_id} failed: {e}");
    }
    remove_netns(netns_path).await;
}

/// CNI plugin executor (spec §4.4's ambient implementation note): invokes
/// the plugin binary named by the first `.conf`/`.conflist` file under
/// `net_dir`, found in `plugin_dir`, following the CNI env-var/stdin-config
/// calling convention. The plugin's own wire behavior is an external
/// collaborator's concern; this only shells out and parses its JSON result.
pub struct CniPluginExecutor {
    net_dir: String,
    plugin_dir: String,
}

impl CniPluginExecutor {
    pub fn new(net_dir: impl Into<String>, plugin_dir: impl Into<String>) -> Self {
        Self {
            net_dir: net_dir.into(),
            plugin_dir: plugin_dir.into(),
        }
    }

    fn load_network_config(&self) -> Result<(String, serde_json::Value)> {
        let mut entries: Vec<_> = std::fs::read_dir(&self.net_dir)
            .map_err(|e| FraktiError::backend_unavailable("cni", format!("reading {}: {}", self.net_dir, e)))?
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.ends_with(".conf") || name.ends_with(".conflist")
            })
            .collect();
        entries.sort_by_key(|e| e.file_name());
        let entry = entries.into_iter().next().ok_or_else(|| {
            FraktiError::backend_unavailable("cni", format!("no CNI config found in {}", self.net_dir))
        })?;

        let contents = std::fs::read_to_string(entry.path())
            .map_err(|e| FraktiError::backend_unavailable("cni", e.to_string()))?;
        let config: serde_json::Value = serde_json::from_str(&contents)?;
        let plugin_type = config
            .get("type")
            .or_else(|| config.get("plugins").and_then(|p| p.get(0)).and_then(|p| p.get("type")))
            .and_then(|t| t.as_str())
            .ok_or_else(|| FraktiError::backend_unavailable("cni", "config missing plugin type"))?
            .to_string();
        Ok((plugin_type, config))
    }

    async fn run(
        &self,
        command: &str,
        netns_path: &str,
        sandbox_id: &str,
        args_kv: &[(&str, &str)],
    ) -> Result<Vec<u8>> {
        let (plugin_type, config) = self.load_network_config()?;
        let plugin_path = PathBuf::from(&self.plugin_dir).join(&plugin_type);
        let cni_args = args_kv.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(";");
        debug!("cni exec: {} {command}", plugin_path.display());

        let mut child = Command::new(&plugin_path)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", sandbox_id)
            .env("CNI_NETNS", netns_path)
            .env("CNI_IFNAME", "eth0")
            .env("CNI_ARGS", cni_args)
            .env("CNI_PATH", &self.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FraktiError::backend_unavailable("cni", format!("{}: {e}", plugin_path.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&config)?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| FraktiError::backend_unavailable("cni", e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FraktiError::backend_unavailable("cni", e.to_string()))?;
        if !output.status.success() {
            return Err(FraktiError::backend_unavailable(
                "cni",
                format!("{plugin_type} {command} failed: {}", String::from_utf8_lossy(&output.stderr)),
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl NetworkPlugin for CniPluginExecutor {
    async fn setup(
        &self,
        netns_path: &str,
        sandbox_id: &str,
        metadata: &HashMap<String, String>,
        _annotations: &HashMap<String, String>,
    ) -> Result<CniResult> {
        let mut args: Vec<(&str, &str)> = Vec::new();
        if let Some(name) = metadata.get("name") {
            args.push(("K8S_POD_NAME", name));
        }
        if let Some(namespace) = metadata.get("namespace") {
            args.push(("K8S_POD_NAMESPACE", namespace));
        }

        let stdout = self.run("ADD", netns_path, sandbox_id, &args).await?;
        let result: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|e| FraktiError::backend_unavailable("cni", format!("parsing CNI result: {e}")))?;

        let interface = result.get("interfaces").and_then(|v| v.as_array()).and_then(|v| v.first());
        let if_name = interface
            .and_then(|i| i.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("eth0")
            .to_string();
        let mac = interface.and_then(|i| i.get("mac")).and_then(|m| m.as_str()).unwrap_or_default().to_string();

        let ip_entry = result.get("ips").and_then(|v| v.as_array()).and_then(|v| v.first());
        let ip = ip_entry.and_then(|i| i.get("address")).and_then(|a| a.as_str()).unwrap_or_default().to_string();
        let gateway = ip_entry
            .and_then(|i| i.get("gateway"))
            .and_then(|g| g.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(CniResult {
            network: NetworkInfo {
                bridge_name: RELAY_BRIDGE_NAME.to_string(),
                if_name,
                mac,
                ip,
                gateway,
            },
        })
    }

    async fn tear_down(&self, netns_path: &str, sandbox_id: &str, _annotations: &HashMap<String, String>) -> Result<()> {
        self.run("DEL", netns_path, sandbox_id, &[]).await.map(|_| ())
    }

    async fn status(&self) -> Result<()> {
        self.load_network_config().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netns_name_extracted_from_path() {
        assert_eq!(
            netns_name("/var/run/netns/frakti-abcd1234"),
            Some("frakti-abcd1234".to_string())
        );
    }

    #[test]
    fn random_hex_has_requested_length() {
        assert_eq!(random_hex(8).len(), 8);
        assert!(random_hex(8).chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cni_executor_reads_plugin_type_from_conflist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-mynet.conflist"),
            r#"{"name": "mynet", "plugins": [{"type": "bridge"}]}"#,
        )
        .unwrap();

        let executor = CniPluginExecutor::new(dir.path().to_string_lossy().into_owned(), "/opt/cni/bin");
        let (plugin_type, _) = executor.load_network_config().unwrap();
        assert_eq!(plugin_type, "bridge");
    }

    #[test]
    fn cni_executor_picks_first_config_file_alphabetically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("10-a.conf"), r#"{"type": "ptp"}"#).unwrap();
        std::fs::write(dir.path().join("20-b.conf"), r#"{"type": "bridge"}"#).unwrap();

        let executor = CniPluginExecutor::new(dir.path().to_string_lossy().into_owned(), "/opt/cni/bin");
        let (plugin_type, _) = executor.load_network_config().unwrap();
        assert_eq!(plugin_type, "ptp");
    }

    #[test]
    fn cni_executor_errors_when_net_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CniPluginExecutor::new(dir.path().to_string_lossy().into_owned(), "/opt/cni/bin");
        assert!(executor.load_network_config().is_err());
    }
}
