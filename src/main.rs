use dockname::config::Config;
use dockname::discovery::{Discovery, ShutdownHandle};
use dockname::docker::DockerSource;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockname=debug".parse().expect("valid log directive")),
        )
        .init();

    // Configuration file is optional; defaults cover a standard setup
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };

    print_startup_banner(&config);

    let source = DockerSource::new(config.docker.host.as_deref()).await?;
    let discovery = Discovery::new(Arc::new(source), config);

    tokio::spawn(wait_for_signal(discovery.shutdown_handle()));

    let result = discovery.run().await;
    match &result {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!(error = %e, "Dockname stopped with an error"),
    }
    result.map_err(Into::into)
}

/// Raise shutdown on Ctrl+C or SIGTERM
async fn wait_for_signal(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down...");
    }

    handle.shutdown();
}

fn print_startup_banner(config: &Config) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        port = config.server.port,
        "Starting dockname"
    );
    info!(
        update_interval_secs = config.watch.update_interval_secs,
        retry_attempts = config.watch.retry_attempts,
        retry_delay_ms = config.watch.retry_delay_ms,
        "Container watch configured"
    );
    info!(
        max_idle = config.server.pool_max_idle_per_host,
        idle_timeout_secs = config.server.pool_idle_timeout_secs,
        drain_timeout_secs = config.server.drain_timeout_secs,
        "Connection pool configured"
    );
    if let Some(host) = &config.docker.host {
        info!(host, "Using configured Docker host");
    }
}
