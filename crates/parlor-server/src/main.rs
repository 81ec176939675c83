//! Parlor server binary.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `parlor-config.yaml` (or `PARLOR_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Open the store: `PostgreSQL` with migrations when `database_url` is
//!    set, in-memory otherwise
//! 4. Build the payment gateway client
//! 5. Connect to NATS for presence fan-out, if configured
//! 6. Assemble the hub, insert seed users, start the idle reaper
//! 7. Serve HTTP + `WebSocket` until `Ctrl-C`, then close the store

use std::path::PathBuf;
use std::sync::Arc;

use parlor_db::{PgStore, PostgresConfig, PostgresPool, Store};
use parlor_hub::config::{InfrastructureConfig, LoggingConfig};
use parlor_hub::presence::connect_nats;
use parlor_hub::{Hub, ParlorConfig, PaymentGateway};
use parlor_server::{AppState, start_server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "parlor-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any initialization step or the server fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("PARLOR_CONFIG")
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = ParlorConfig::load(&config_path)?;

    init_tracing(&config.logging);
    info!(
        config = %config_path.display(),
        port = config.server.port,
        provider_share = %config.settlement.provider_share.provider_share(),
        legacy_broadcast = config.routing.legacy_broadcast,
        "parlor-server starting"
    );

    let store = open_store(&config.infrastructure).await?;
    let gateway = PaymentGateway::from_config(&config.gateway)?;
    info!(store = store.backend(), gateway = gateway.name(), "backends ready");

    let hub = match &config.infrastructure.nats_url {
        Some(url) => match connect_nats(url).await {
            Ok(client) => Hub::with_nats(store, gateway, &config, client),
            Err(e) => {
                warn!(error = %e, "NATS unavailable, presence stays in-process");
                Hub::new(store, gateway, &config)
            }
        },
        None => Hub::new(store, gateway, &config),
    };
    let hub = Arc::new(hub);

    let seeded = hub.seed(&config.seed_users).await?;
    info!(seeded, configured = config.seed_users.len(), "seed users applied");

    let reaper = hub.spawn_idle_reaper();

    let state = Arc::new(AppState::new(Arc::clone(&hub)));
    let result = start_server(&config.server, state).await;
    reaper.abort();
    hub.store().close().await;
    result?;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn open_store(infra: &InfrastructureConfig) -> Result<Store, parlor_db::DbError> {
    let Some(url) = &infra.database_url else {
        info!("no database_url configured, using the in-memory store");
        return Ok(Store::memory());
    };
    let pool =
        PostgresPool::connect(&PostgresConfig::new(url).with_max_connections(infra.max_connections))
            .await?;
    pool.run_migrations().await?;
    Ok(Store::from(PgStore::new(pool)))
}
