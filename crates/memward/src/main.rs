use anyhow::{Context, Result};
use memwar_core::{ContactStore, RemoteMatcher, SqliteStorage};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("memward starting");

    let config = config::Config::from_env();
    if config.user.is_none() {
        tracing::warn!("no MEMWAR_USER or USER set; captures will be refused until someone signs in");
    }

    let storage = SqliteStorage::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let store = ContactStore::open(Box::new(storage), config.store_scope()).context("loading contacts")?;
    let events = store.subscribe();
    let store = Arc::new(Mutex::new(store));

    let engine = engine::spawn_engine(engine::EngineSettings {
        camera_device: config.camera_device.clone(),
        warmup_frames: config.warmup_frames,
        capture_attempts: config.capture_attempts,
        jpeg_quality: config.jpeg_quality,
    })?;

    let matcher = RemoteMatcher::new(&config.matcher_url, config.matcher_timeout());
    tracing::info!(url = %matcher.endpoint(), "remote matcher configured");

    let service = dbus_interface::MemwarService::new(dbus_interface::ServiceParts {
        store,
        engine,
        matcher,
        user: config.user.clone(),
        snap_dir: config.snap_dir.clone(),
        default_location: config.default_location.clone(),
        camera_device: config.camera_device.clone(),
    });

    let connection = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tokio::spawn(dbus_interface::forward_store_events(connection.clone(), events));

    tracing::info!(bus = dbus_interface::BUS_NAME, "memward ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("memward shutting down");

    Ok(())
}
