use anyhow::Result;
use helios::config::Config;
use helios::hub::WallboxHub;
use tokio_stream::StreamExt;
use tracing::{error, info};

const APP_VERSION: &str = env!("APP_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    config.validate()?;

    helios::logging::init_logging(&config.logging)?;

    info!(
        "Helios {} ({}) starting with {} device(s)",
        APP_VERSION,
        env!("APP_GIT_SHA"),
        config.devices.len()
    );
    if config.devices.is_empty() {
        error!("No devices configured; nothing to do");
        return Ok(());
    }

    let hub = WallboxHub::start(&config)?;

    // Log every published snapshot at trace level
    let mut watchers = Vec::new();
    for id in hub.device_ids() {
        let mut stream = hub.subscribe(&id)?;
        watchers.push(tokio::spawn(async move {
            while let Some(snapshot) = stream.next().await {
                match serde_json::to_string(&*snapshot) {
                    Ok(json) => tracing::trace!("snapshot {}", json),
                    Err(e) => error!("Failed to serialize snapshot: {}", e),
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    hub.shutdown().await;
    for watcher in watchers {
        watcher.abort();
    }
    info!("Helios stopped");
    Ok(())
}
