use clap::Parser;
use frakti_core::{CgroupDriver, Endpoint, FraktiConfig, Frakti, RemoteBackend};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "frakti")]
#[command(author, version, about = "CRI shim that dispatches pod and container lifecycle calls across hypervisor, privileged, and unikernel backends", long_about = None)]
struct Cli {
    /// Unix socket path for the CRI gRPC surface.
    #[arg(long, default_value = "/var/run/frakti.sock")]
    listen: String,

    /// host:port of the hypervisor backend's gRPC endpoint.
    #[arg(long, default_value = "127.0.0.1:22318")]
    hyper_endpoint: String,

    /// Bind address for the hypervisor backend's streaming HTTP server.
    #[arg(long, default_value = "0.0.0.0")]
    streaming_server_addr: String,

    /// Bind port for the hypervisor backend's streaming HTTP server.
    #[arg(long, default_value_t = 10250)]
    streaming_server_port: u16,

    /// CNI network configuration directory.
    #[arg(long, default_value = "/etc/cni/net.d")]
    cni_net_dir: String,

    /// CNI plugin binary directory.
    #[arg(long, default_value = "/opt/cni/bin")]
    cni_plugin_dir: String,

    /// Privileged (OS-container) backend endpoint, a unix socket URI.
    #[arg(long)]
    docker_endpoint: Option<String>,

    /// Construct the privileged backend; if false it is never dialed.
    #[arg(long, default_value_t = false)]
    enable_alternative_runtime: bool,

    /// Cgroup driver; must match the kubelet's.
    #[arg(long, default_value = "cgroupfs")]
    cgroup_driver: String,

    /// Enable the unikernel (image-only) backend.
    #[arg(long, default_value_t = false)]
    enable_unikernel: bool,

    /// Image-reference prefix routed to the unikernel backend.
    #[arg(long)]
    unikernel_prefix: Option<String>,

    /// host:port of the unikernel backend, when enabled.
    #[arg(long)]
    unikernel_endpoint: Option<String>,

    /// Print version and exit.
    #[arg(long, default_value_t = false)]
    version: bool,

    /// Raise log verbosity.
    #[arg(short, long, global = true)]
    verbose: bool,
}

fn parse_cgroup_driver(raw: &str) -> CgroupDriver {
    match raw {
        "systemd" => CgroupDriver::Systemd,
        _ => CgroupDriver::Cgroupfs,
    }
}

impl From<&Cli> for FraktiConfig {
    fn from(cli: &Cli) -> Self {
        FraktiConfig {
            listen: cli.listen.clone(),
            hyper_endpoint: cli.hyper_endpoint.clone(),
            streaming_server_addr: cli.streaming_server_addr.clone(),
            streaming_server_port: cli.streaming_server_port,
            cni_net_dir: cli.cni_net_dir.clone(),
            cni_plugin_dir: cli.cni_plugin_dir.clone(),
            docker_endpoint: cli.docker_endpoint.clone(),
            enable_alternative_runtime: cli.enable_alternative_runtime,
            cgroup_driver: parse_cgroup_driver(&cli.cgroup_driver),
            unikernel_prefix: cli.unikernel_prefix.clone(),
            enable_unikernel: cli.enable_unikernel,
            verbose: cli.verbose,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("frakti {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    if let Err(e) = run(&cli).await {
        log::error!("frakti exiting: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> frakti_core::Result<()> {
    let config: FraktiConfig = cli.into();

    log::info!("dialing hypervisor backend at {}", config.hyper_endpoint);
    let hypervisor = Arc::new(RemoteBackend::new(
        "hypervisor",
        Endpoint::Tcp(config.hyper_endpoint.clone()),
    ));

    let privileged = if config.enable_alternative_runtime {
        let docker_endpoint = config.docker_endpoint.clone().ok_or_else(|| {
            frakti_core::FraktiError::invalid_argument(
                "enable-alternative-runtime requires docker-endpoint",
            )
        })?;
        log::info!("dialing privileged backend at {docker_endpoint}");
        Some(Arc::new(RemoteBackend::new(
            "privileged",
            Endpoint::Unix(docker_endpoint),
        )))
    } else {
        None
    };

    let unikernel = if config.enable_unikernel {
        let endpoint = cli.unikernel_endpoint.clone().ok_or_else(|| {
            frakti_core::FraktiError::invalid_argument("enable-unikernel requires unikernel-endpoint")
        })?;
        log::info!("dialing unikernel backend at {endpoint}");
        Some(Arc::new(RemoteBackend::new("unikernel", Endpoint::Tcp(endpoint))))
    } else {
        None
    };

    let network = Arc::new(frakti_core::CniPluginExecutor::new(
        config.cni_net_dir.clone(),
        config.cni_plugin_dir.clone(),
    ));

    let frakti = Frakti::new(config, hypervisor, network, privileged, unikernel).await?;

    let listener = frakti.bind().await?;
    log::info!("listening on {}", frakti.config().listen);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .map_err(|e| frakti_core::FraktiError::backend_unavailable("signal", e.to_string()))?;

    log::info!("frakti running; serving CRI requests until interrupted");
    tokio::select! {
        _ = shutdown_rx.recv() => {
            log::info!("received shutdown signal, stopping");
        }
        accepted = listener.accept() => {
            if let Ok((_socket, peer)) = accepted {
                log::debug!("accepted connection from {peer:?}; gRPC transport wiring lives at the embedder");
            }
        }
    }

    Ok(())
}
