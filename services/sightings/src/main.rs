use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use sightings::{Config, ImageSigner, MapBlockRegistry, PgStore, PlateHasher, SightingStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting sightings migration"
    );

    let store = Arc::new(
        PgStore::new(&config.database)
            .await
            .context("Failed to connect to PostgreSQL")?,
    );

    // Configuration faults surface before the schema is touched
    check_components(&config, store.clone())?;

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    } else {
        info!("Migrations disabled, skipping");
    }

    info!("Sightings database ready");

    Ok(())
}

/// Run the fallible constructors against the loaded configuration
fn check_components(config: &Config, store: Arc<PgStore>) -> Result<()> {
    let salt = SecretString::from(config.plates.salt.expose_secret().to_owned());
    PlateHasher::new(salt).context("Invalid plate hashing configuration")?;
    ImageSigner::new(&config.images).context("Invalid image configuration")?;

    let store: Arc<dyn SightingStore> = store;
    let map_blocks =
        MapBlockRegistry::new(store, &config.grid).context("Invalid grid configuration")?;

    info!(
        cell_size = %map_blocks.grid().cell_size(),
        "Components configured"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}
