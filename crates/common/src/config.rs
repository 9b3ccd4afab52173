use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Change-feed polling interval in milliseconds (default: 1000)
    pub feed_poll_interval_ms: u64,

    /// Maximum number of feed rows fetched per poll (default: 100)
    pub feed_batch_size: u32,

    /// Number of notifications dispatched concurrently by the worker (default: 16)
    pub worker_concurrency: usize,

    /// Delivery attempts per submission, including the first (default: 5)
    pub dispatch_max_attempts: u32,

    /// Base delay for exponential retry backoff (default: 200)
    pub retry_base_ms: u64,

    /// Upper bound for a single backoff delay (default: 10000)
    pub retry_max_ms: u64,

    /// Uniform jitter added to each backoff delay (default: 100)
    pub retry_jitter_ms: u64,

    /// Timeout for a recipient directory lookup (default: 2000)
    pub resolve_timeout_ms: u64,

    /// Timeout for a single transport send (default: 5000)
    pub send_timeout_ms: u64,

    /// Lease on an in-flight dispatch claim, in seconds (default: 120)
    pub claim_lease_secs: u64,

    /// Retention of stored outcomes, in seconds (default: 7 days)
    pub outcome_retention_secs: u64,

    /// Age after which a cached device token is re-read (default: 300)
    pub directory_cache_ttl_secs: u64,

    /// Firebase project that owns the FCM sender
    pub fcm_project_id: Option<String>,

    /// OAuth2 access token for the FCM HTTP v1 API
    pub fcm_access_token: Option<String>,

    /// Base URL of the FCM API (default: https://fcm.googleapis.com)
    pub fcm_endpoint: String,

    /// Port the HTTP ingress listens on (default: 3000)
    pub api_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            feed_poll_interval_ms: parse_var("FEED_POLL_INTERVAL_MS", "1000")?,
            feed_batch_size: parse_var("FEED_BATCH_SIZE", "100")?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", "16")?,
            dispatch_max_attempts: parse_var("DISPATCH_MAX_ATTEMPTS", "5")?,
            retry_base_ms: parse_var("RETRY_BASE_MS", "200")?,
            retry_max_ms: parse_var("RETRY_MAX_MS", "10000")?,
            retry_jitter_ms: parse_var("RETRY_JITTER_MS", "100")?,
            resolve_timeout_ms: parse_var("RESOLVE_TIMEOUT_MS", "2000")?,
            send_timeout_ms: parse_var("SEND_TIMEOUT_MS", "5000")?,
            claim_lease_secs: parse_var("CLAIM_LEASE_SECS", "120")?,
            outcome_retention_secs: parse_var("OUTCOME_RETENTION_SECS", "604800")?,
            directory_cache_ttl_secs: parse_var("DIRECTORY_CACHE_TTL_SECS", "300")?,
            fcm_project_id: std::env::var("FCM_PROJECT_ID").ok(),
            fcm_access_token: std::env::var("FCM_ACCESS_TOKEN").ok(),
            fcm_endpoint: std::env::var("FCM_ENDPOINT")
                .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
            api_port: parse_var("API_PORT", "3000")?,
        })
    }

    /// FCM credentials, when both project and access token are configured.
    pub fn fcm_credentials(&self) -> Option<(&str, &str)> {
        match (&self.fcm_project_id, &self.fcm_access_token) {
            (Some(project), Some(token)) if !project.is_empty() && !token.is_empty() => {
                Some((project.as_str(), token.as_str()))
            }
            _ => None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        })
}
