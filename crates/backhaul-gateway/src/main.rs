//! Backhaul gateway daemon
//!
//! This binary runs the public side of the reverse tunnels: it accepts
//! backend announcements over per-service control sockets and routes public
//! TCP connections across the live backends, round robin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backhaul_control::{
    AnnounceListener, EndpointEvent, LockFileMonitor, Service, ServiceSettings,
};
use backhaul_proxy::{ProxyServer, ProxyServerConfig};

mod config;
mod hooks;

use config::{GatewayConfig, ServiceSpec};

/// Reverse tunnel gateway - routes public TCP connections across announced backends
#[derive(Parser, Debug)]
#[command(name = "backhauld")]
#[command(about = "Run the backhaul reverse tunnel gateway", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a template configuration file to stdout
    Template,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the gateway config file (YAML)
    #[arg(long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for control sockets and liveness lock files
    /// Overrides the config file; defaults to /var/run/backhaul
    #[arg(long, env = "BACKHAUL_RUN_DIR")]
    run_dir: Option<PathBuf>,

    /// Declare a service inline (repeatable, format: NAME=PORT)
    /// Overrides config file entries with the same name
    #[arg(long = "service", value_name = "NAME=PORT")]
    services: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BACKHAUL_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle subcommands
    if let Some(command) = cli.command {
        return match command {
            Commands::Template => {
                print!("{}", GatewayConfig::template());
                Ok(())
            }
        };
    }

    // Otherwise, run the gateway
    let args = cli.server_args;

    // Initialize logging
    init_logging(&args.log_level)?;

    // Assemble the effective configuration
    let mut config = match args.config {
        Some(ref path) => {
            info!("Loading config from {:?}", path);
            GatewayConfig::load(path)?
        }
        None => GatewayConfig::default(),
    };
    config.merge_inline_services(&args.services)?;

    if config.services.is_empty() {
        anyhow::bail!(
            "No services configured. Provide --config or at least one --service NAME=PORT"
        );
    }

    let run_dir = args
        .run_dir
        .or_else(|| config.run_dir.clone())
        .unwrap_or_else(|| PathBuf::from(backhaul_proto::DEFAULT_RUN_DIR));

    info!("🚀 Starting backhaul gateway");
    info!("Run directory: {:?}", run_dir);
    info!("Configured services: {}", config.services.len());

    // All services share one liveness monitor over the run directory
    let monitor = Arc::new(LockFileMonitor::new(&run_dir));

    let mut services: Vec<Arc<Service>> = Vec::new();
    let mut server_handles: Vec<JoinHandle<()>> = Vec::new();

    for spec in &config.services {
        let (service, handles) = start_service(spec, &config, &run_dir, monitor.clone()).await?;
        services.push(service);
        server_handles.extend(handles);
    }

    info!("✅ Backhaul gateway is running");
    info!("Press Ctrl+C to stop");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping servers...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    // Stop accepting announcements and connections, then drop the watchers.
    // In-flight relays are torn down with the process.
    for handle in &server_handles {
        handle.abort();
    }
    for service in &services {
        service.shutdown();
    }
    info!("✅ Backhaul gateway stopped");

    Ok(())
}

/// Wire up one logical service: control socket, public listener, event
/// logger. Bind failures stop startup.
async fn start_service(
    spec: &ServiceSpec,
    config: &GatewayConfig,
    run_dir: &Path,
    monitor: Arc<LockFileMonitor>,
) -> Result<(Arc<Service>, Vec<JoinHandle<()>>)> {
    let settings = ServiceSettings {
        announce_timeout: spec.announce_timeout(&config.defaults),
    };
    let service = Arc::new(Service::new(spec.name.clone(), monitor).with_settings(settings));

    let announce = AnnounceListener::bind(run_dir, &spec.name)
        .await
        .with_context(|| {
            format!(
                "Failed to start control channel for service '{}'",
                spec.name
            )
        })?;

    let bind_addr = spec.bind_addr(&config.defaults)?;
    let proxy = ProxyServer::bind(ProxyServerConfig { bind_addr }, service.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to start proxy listener for service '{}'",
                spec.name
            )
        })?;

    info!(
        "Service '{}' ready: control socket {:?}, public listener {}",
        spec.name,
        announce.path(),
        proxy.local_addr()?
    );

    let mut handles = Vec::new();

    let announce_service = service.clone();
    let announce_name = spec.name.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = announce.run(announce_service).await {
            error!("Control channel error for service {}: {}", announce_name, e);
        }
    }));

    let proxy_name = spec.name.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!("Proxy server error for service {}: {}", proxy_name, e);
        }
    }));

    handles.push(spawn_event_logger(service.clone(), spec.clone()));

    Ok((service, handles))
}

/// Log backend arrivals and departures and run the configured hooks.
fn spawn_event_logger(service: Arc<Service>, spec: ServiceSpec) -> JoinHandle<()> {
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EndpointEvent::Added(endpoint)) => {
                    info!(
                        "🔗 Backend connected to service {}: pid {} (user {}, dispatch {})",
                        service.name(),
                        endpoint.pid,
                        endpoint.uname,
                        endpoint.dispatch_addr()
                    );
                    if let Some(ref command) = spec.on_connect {
                        hooks::spawn_hook(command, service.name(), &endpoint);
                    }
                }
                Ok(EndpointEvent::Removed { endpoint, reason }) => {
                    let uptime = chrono::Utc::now() - endpoint.registered_at;
                    info!(
                        "Backend disconnected from service {}: pid {} ({}, up {}s)",
                        service.name(),
                        endpoint.pid,
                        reason,
                        uptime.num_seconds()
                    );
                    if let Some(ref command) = spec.on_disconnect {
                        hooks::spawn_hook(command, service.name(), &endpoint);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        "Event logger for service {} lagged, {} events dropped",
                        service.name(),
                        missed
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
