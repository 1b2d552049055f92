use crate::config::LogFormat;
use crate::state::HealthState;
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cluster;
mod config;
mod controller;
mod event_router;
mod image_reference;
mod mirror;
mod oci_registry;
mod readiness;
mod reconciler;
mod secret_string;
mod signals;
mod state;
mod webserver;
mod workload;
mod workqueue;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;
    init_tracing(config.logging.format);
    info!("Starting kube-image-mirror {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config from {}", config_path);

    let shutdown = CancellationToken::new();
    signals::spawn_signal_handler(shutdown.clone())?;

    let health = HealthState::default();
    let app = webserver::create_app(health.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let webserver_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { webserver_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("Webserver failed: {}", e);
        }
    });

    controller::run(config, health, shutdown).await?;

    info!("Shutdown complete");
    Ok(())
}
