use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use maas_ipam_alloc::{BusHook, IpamService};
use maas_ipam_core::config::Config;
use maas_ipam_core::db::Db;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "maas-ipam", about = "MAAS IP address management core")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/maas/ipam.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;

    init_logging(&config.logging);

    info!(instance_id = %config.instance.id, "starting maas-ipam");

    let db = Db::open(&config.database.path)?;
    info!(path = %config.database.path.display(), "database opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Message bus
    let (backend, topic_prefix, url) = match config.messaging {
        Some(ref msg_config) => (
            msg_config.backend.clone(),
            msg_config.topic_prefix.clone(),
            msg_config.url.clone(),
        ),
        None => ("noop".to_string(), "maas".to_string(), None),
    };

    let message_bus: Arc<dyn maas_ipam_msg::MessageBus> = Arc::from(
        maas_ipam_msg::create_message_bus(
            &backend,
            &config.instance.id,
            &topic_prefix,
            url.as_deref(),
        )
        .await?,
    );
    info!(backend = %backend, "message bus initialized");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let forwarder = maas_ipam_msg::spawn_forwarder(message_bus.clone(), event_rx);

    let service = Arc::new(
        IpamService::new(db, &config.ipam)
            .with_instance_id(&config.instance.id)
            .with_hook(Arc::new(BusHook::new(event_tx))),
    );

    // Warnings may be stale if the threshold changed since the last run
    let reconcile = service.clone();
    tokio::task::spawn_blocking(move || reconcile.reconcile_exhaustion_all()).await??;

    // Provisional address purge
    let interval_secs = config.ipam.provisional_purge_interval_secs;
    if interval_secs > 0 {
        let purge = service.clone();
        let mut rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let svc = purge.clone();
                        match tokio::task::spawn_blocking(move || {
                            svc.purge_expired_provisional(Utc::now())
                        })
                        .await
                        {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!("provisional purge failed: {e}"),
                            Err(e) => error!("provisional purge task panicked: {e}"),
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        }));
        info!(interval_secs, "provisional purge started");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    // Dropping the last hook closes the event channel and lets the
    // forwarder drain
    drop(service);
    let _ = forwarder.await;

    if let Err(e) = message_bus.shutdown().await {
        error!("message bus shutdown error: {e}");
    }

    info!("maas-ipam stopped");
    Ok(())
}

fn init_logging(config: &maas_ipam_core::config::LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
