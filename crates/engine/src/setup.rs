//! Wiring of the dispatch engine from application configuration.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use courier_common::config::AppConfig;
use courier_notifier::{DeliveryTransport, FcmTransport, LogTransport};

use crate::directory::{PgAddressStore, RecipientDirectory};
use crate::dispatcher::{DispatchConfig, DispatchEngine};
use crate::store::RedisOutcomeStore;

/// Redis key prefix for dispatch leases and outcomes.
pub const OUTCOME_KEY_PREFIX: &str = "courier:dispatch";

/// Pick the push transport: FCM when credentials are configured, otherwise
/// the log-only dry-run transport.
pub fn build_transport(config: &AppConfig) -> anyhow::Result<Arc<dyn DeliveryTransport>> {
    match config.fcm_credentials() {
        Some((project_id, access_token)) => {
            let transport = FcmTransport::new(&config.fcm_endpoint, project_id, access_token)?;
            tracing::info!(project_id, endpoint = %config.fcm_endpoint, "Using FCM transport");
            Ok(Arc::new(transport))
        }
        None => {
            tracing::warn!("FCM credentials not configured — notifications will only be logged");
            Ok(Arc::new(LogTransport::new()))
        }
    }
}

/// Build the production engine: Postgres directory, Redis outcome store.
pub fn build_engine(
    config: &AppConfig,
    pool: PgPool,
    redis: ConnectionManager,
) -> anyhow::Result<DispatchEngine> {
    let directory = RecipientDirectory::with_cache_ttl(
        Arc::new(PgAddressStore::new(pool)),
        Duration::from_secs(config.directory_cache_ttl_secs),
    );
    let store = RedisOutcomeStore::new(
        redis,
        OUTCOME_KEY_PREFIX,
        Duration::from_secs(config.outcome_retention_secs),
    );

    Ok(DispatchEngine::new(
        Arc::new(directory),
        build_transport(config)?,
        Arc::new(store),
        DispatchConfig::from_app_config(config),
    ))
}
