mod admin;
mod cli;
mod client;
mod config;
mod discovery;
mod domain;
mod error;
mod gateway;
mod invocation;
mod prober;
mod reconciler;
mod registry;
mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use gateway::Gateway;

/// Shared initialization: config, tracing, registry, backends, prober,
/// watcher, admin. Grounded on the teacher's `initialize`, trimmed to this
/// design's components (no daemon, no semantic index, no secrets resolver).
async fn initialize(cli: &cli::Cli) -> Result<(Arc<Gateway>, tokio::sync::watch::Sender<bool>)> {
    let config = Config::load(&cli.config).with_context(|| {
        format!("failed to load config from {}", cli.config.display())
    })?;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "gateway starting"
    );

    let admin_listen = cli.admin_listen.clone().or_else(|| config.admin_listen.clone());

    let gateway = Arc::new(Gateway::new(config));
    gateway.start_all().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    {
        let gateway = Arc::clone(&gateway);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            prober::run(
                Arc::clone(gateway.registry()),
                Arc::clone(gateway.clients()),
                prober::ProberSettings::default(),
                Duration::from_secs(5),
                shutdown_rx,
            )
            .await;
        });
    }

    {
        let gateway = Arc::clone(&gateway);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            supervisor::run_monitor(
                Arc::clone(gateway.registry()),
                Arc::clone(gateway.supervisor()),
                supervisor::RestartSettings::default(),
                Duration::from_secs(10),
                shutdown_rx,
            )
            .await;
        });
    }

    {
        let gateway = Arc::clone(&gateway);
        let config_path = cli.config.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let current_config = gateway.config_swap();
            let gateway_for_reconcile = Arc::clone(&gateway);
            config::watch_config(
                config_path,
                current_config,
                move |diff| {
                    let gateway = Arc::clone(&gateway_for_reconcile);
                    Box::pin(async move {
                        let reconciler = crate::reconciler::Reconciler {
                            registry: Arc::clone(gateway.registry()),
                            clients: Arc::clone(gateway.clients()),
                            supervisor: Arc::clone(gateway.supervisor()),
                            request_timeout: gateway.config().request_timeout,
                        };
                        let result = reconciler.reconcile(diff).await;
                        info!(
                            added = result.added.len(),
                            removed = result.removed.len(),
                            updated = result.updated.len(),
                            errors = result.errors.len(),
                            "config reconciled"
                        );
                    })
                },
                shutdown_rx,
            )
            .await;
        });
    }

    #[cfg(feature = "admin")]
    if let Some(listen) = admin_listen {
        let admin_state = admin::api::AdminState {
            gateway: Arc::clone(&gateway),
            config_path: cli.config.clone(),
        };
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::api::start(admin_state, &listen, shutdown_rx).await {
                warn!(error = %e, "admin API failed");
            }
        });
    }
    #[cfg(not(feature = "admin"))]
    let _ = admin_listen;

    Ok((gateway, shutdown_tx))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let (gateway, shutdown_tx) = initialize(&cli).await?;

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received ctrl-c");
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    gateway.shutdown(Duration::from_secs(10)).await;

    Ok(())
}
