use clap::Parser;
use powergate::config::Config;
use powergate::dispatcher::Dispatcher;
use powergate::lifecycle::{LifecycleManager, LifecycleSettings};
use powergate::monitor::{InactivityMonitor, MonitorSettings};
use powergate::power::{IpmiController, PowerController};
use powergate::proxy::ProxyServer;
use powergate::queue::{QueueSettings, SHUTDOWN_REASON};
use powergate::upstream::Upstream;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long servers get to wind down after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Reverse proxy that powers its backend on with traffic and off when idle
#[derive(Parser, Debug)]
#[command(name = "powergate", version, about)]
struct Args {
    /// Path to the configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("powergate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).map_err(|e| {
        error!(path = %args.config.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %args.config.display(), "Configuration loaded");
    print_startup_banner(&config);

    let bind_ip: IpAddr = config.proxy_host.parse().map_err(|e| {
        error!(proxy_host = %config.proxy_host, error = %e, "Invalid proxy_host");
        anyhow::anyhow!("Invalid proxy_host '{}': {}", config.proxy_host, e)
    })?;

    let power: Arc<dyn PowerController> = Arc::new(IpmiController::new(&config.ipmi)?);
    let lifecycle = LifecycleManager::new(power, LifecycleSettings::from_config(&config));
    let monitor = InactivityMonitor::new(Arc::clone(&lifecycle), MonitorSettings::from_config(&config));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut dispatchers = Vec::with_capacity(config.port_mappings.len());
    let mut tasks = Vec::new();

    for &mapping in &config.port_mappings {
        let dispatcher = Dispatcher::new(
            mapping,
            Arc::clone(&lifecycle),
            Arc::clone(&monitor),
            QueueSettings::from_config(&config),
            Upstream::new(&config.target_host, mapping.target_port, config.upstream_timeout()),
        );
        tasks.push(dispatcher.spawn_watcher(shutdown_rx.clone()));

        let server = ProxyServer::new(
            SocketAddr::new(bind_ip, mapping.listen_port),
            Arc::clone(&dispatcher),
            shutdown_rx.clone(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(%mapping, error = %e, "Proxy server error");
            }
        }));

        dispatchers.push(dispatcher);
    }

    monitor.start();

    // Resolve the initial backend state without holding up the listeners
    let initial = Arc::clone(&lifecycle);
    tokio::spawn(async move {
        let state = initial.state().await;
        info!(%state, "Initial backend state");
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let wound_down = tokio::time::timeout(SHUTDOWN_GRACE, async {
        monitor.stop().await;
        for dispatcher in &dispatchers {
            dispatcher.queue().clear(SHUTDOWN_REASON).await;
        }
        futures::future::join_all(tasks).await;
    })
    .await;

    if wound_down.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Shutdown grace period exceeded"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        proxy_host = %config.proxy_host,
        target_host = %config.target_host,
        port_mappings = %config
            .port_mappings
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        "Server configuration"
    );
    info!(
        ipmi_host = %config.ipmi.ipmi_host,
        ipmi_interface = %config.ipmi.ipmi_interface,
        ipmi_path = %config.ipmi.ipmi_path,
        max_retries = config.ipmi.ipmi_max_retries,
        command_timeout_secs = config.ipmi.ipmi_command_timeout_secs,
        "Power management settings"
    );
    info!(
        inactivity_timeout_secs = config.inactivity_timeout_secs,
        check_interval_secs = config.check_interval_secs,
        startup_timeout_secs = config.startup_timeout_secs,
        "Power lifecycle settings"
    );
    info!(
        max_queue_size = config.max_queue_size,
        request_timeout_secs = config.request_timeout_secs,
        upstream_timeout_secs = config.upstream_timeout_secs,
        "Request handling settings"
    );
}
