use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dpbridge::Config;
use dpbridge::DeviceEvent;
use dpbridge::MultiManager;
use dpbridge::config::LoggingConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Aggregate devices reported by several sources into one view.
#[derive(Debug, Parser)]
#[command(name = "dpbridge", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(default_value = "dpbridge.toml")]
    config: PathBuf,

    /// Trace every message of a device (repeatable)
    #[arg(long = "watch", value_name = "DEVICE_ID")]
    watch: Vec<String>,
}

fn init_logging(config: &LoggingConfig) {
    let mut targets = Targets::new().with_default(LevelFilter::from(config.level));
    for (target, level) in &config.overrides {
        targets = targets.with_target(target.clone(), LevelFilter::from(*level));
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .init();
}

fn spawn_refresh_task(manager: Arc<MultiManager>, interval_secs: u64) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately; the cache was just filled.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            manager.update_device_cache();
        }
    }))
}

fn spawn_event_logger(mut events: broadcast::Receiver<DeviceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::StatusUpdated { device_id, codes }) => {
                    debug!("{} updated: {:?}", device_id, codes)
                }
                Ok(DeviceEvent::DevicesRefreshed { device_count }) => {
                    debug!("{} devices after refresh", device_count)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, skipped {} events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    init_logging(&config.logging);

    info!("dpbridge starting");
    info!("Loaded config from: {}", cli.config.display());

    let mut manager = MultiManager::new(&config.manager);
    for device_id in &cli.watch {
        manager.device_watcher().watch(device_id);
    }
    for (platform, descriptors) in &config.descriptors {
        manager.register_device_descriptors(platform, descriptors.clone());
    }

    manager
        .setup(&config)
        .await
        .context("Failed to set up sources")?;
    info!("Sources: {:?}", manager.account_names());

    manager.update_device_cache();

    let manager = Arc::new(manager);
    let refresh_task = spawn_refresh_task(manager.clone(), config.manager.refresh_interval_secs);
    let event_task = spawn_event_logger(manager.subscribe());

    info!("Press Ctrl+C to exit");
    tokio::select! {
        _ = manager.run() => info!("All sources closed"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        },
    }

    if let Some(task) = refresh_task {
        task.abort();
    }
    event_task.abort();
    manager.remove_device_listeners();
    manager.unload();

    info!("dpbridge shutdown complete");

    Ok(())
}
