use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod encoder;
mod monitor;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::from_env();
    let store = store::SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let (monitor, mut exit) = monitor::spawn_monitor(config.clone(), store.clone())
        .await
        .context("starting monitor")?;

    let service = dbus_interface::RollcallService::new(monitor.clone(), store);
    let _conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(
        bus = dbus_interface::BUS_NAME,
        device = %config.camera_device,
        "rollcalld ready"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("rollcalld shutting down");
            if let Err(e) = monitor.stop().await {
                tracing::warn!(error = %e, "monitor already stopped");
            }
            // Wait for the loop so the camera is released before exit.
            if let Ok(Err(e)) = exit.await {
                tracing::warn!(error = %e, "monitoring ended with an error");
            }
        }
        outcome = &mut exit => {
            match outcome {
                Ok(Ok(stats)) => tracing::info!(records = stats.records_written, "session finished"),
                Ok(Err(e)) => return Err(e).context("monitoring session ended"),
                Err(_) => anyhow::bail!("monitor thread exited without reporting"),
            }
        }
    }

    Ok(())
}
