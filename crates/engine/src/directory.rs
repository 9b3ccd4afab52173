//! Recipient directory: resolves a user to the device token to push to.
//!
//! Lookups go through an in-memory cache in front of a backing
//! [`AddressStore`]. A miss, or an entry older than the cache TTL, refreshes
//! from the store. Users without a registered device resolve to `None`, which
//! is an expected outcome rather than a fault.
//!
//! Negative results are not cached, so a freshly registered token is picked up
//! on the next lookup.
//!
//! Every user carries a generation that `invalidate` and `register` bump. A
//! lookup only writes its result back if the generation it started from is
//! unchanged, so a read racing an invalidation cannot re-cache a dead token.
//!
//! Invalidation is keyed by the token that failed: a token registered after
//! the failing send is left alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use courier_common::types::{DeliveryAddress, UserId};

/// Default age after which a cached token is re-read from the store.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Address store error: {0}")]
    Store(String),
}

/// Backing store of device tokens.
#[async_trait]
pub trait AddressStore: Send + Sync {
    async fn get_address_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<DeliveryAddress>, DirectoryError>;

    /// Forget the user's token after the provider reported it invalid.
    ///
    /// Only clears the token if it still equals `token`; returns whether it
    /// did.
    async fn invalidate(&self, user_id: &UserId, token: &str) -> Result<bool, DirectoryError>;

    /// Register (or replace) the user's token.
    async fn register(&self, user_id: &UserId, token: &str)
    -> Result<DeliveryAddress, DirectoryError>;
}

#[derive(Debug, Clone)]
struct CachedAddress {
    address: DeliveryAddress,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct DirectoryCache {
    entries: HashMap<UserId, CachedAddress>,
    generations: HashMap<UserId, u64>,
}

impl DirectoryCache {
    fn generation(&self, user_id: &UserId) -> u64 {
        self.generations.get(user_id).copied().unwrap_or(0)
    }

    fn bump(&mut self, user_id: &UserId) {
        *self.generations.entry(user_id.clone()).or_insert(0) += 1;
    }
}

/// Cached front of an [`AddressStore`].
pub struct RecipientDirectory {
    store: Arc<dyn AddressStore>,
    cache: RwLock<DirectoryCache>,
    cache_ttl: Duration,
}

impl RecipientDirectory {
    pub fn new(store: Arc<dyn AddressStore>) -> Self {
        Self::with_cache_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(store: Arc<dyn AddressStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(DirectoryCache::default()),
            cache_ttl,
        }
    }

    /// Resolve a user to a delivery address.
    ///
    /// Returns `Ok(None)` when the user has no registered device.
    pub async fn resolve(&self, user_id: &UserId) -> Result<Option<DeliveryAddress>, DirectoryError> {
        if user_id.is_empty() {
            return Err(DirectoryError::EmptyUserId);
        }

        let generation = {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.entries.get(user_id)
                && cached.cached_at.elapsed() < self.cache_ttl
            {
                return Ok(Some(cached.address.clone()));
            }
            cache.generation(user_id)
        };

        let address = self.store.get_address_for_user(user_id).await?;

        let mut cache = self.cache.write().await;
        if cache.generation(user_id) != generation {
            // Invalidated or re-registered while the store read was in flight.
            tracing::debug!(user_id = %user_id, "Skipping cache write for superseded lookup");
            return Ok(address);
        }
        match &address {
            Some(address) => {
                cache.entries.insert(
                    user_id.clone(),
                    CachedAddress {
                        address: address.clone(),
                        cached_at: Instant::now(),
                    },
                );
            }
            None => {
                cache.entries.remove(user_id);
            }
        }

        tracing::debug!(
            user_id = %user_id,
            found = address.is_some(),
            "Recipient directory refreshed from store"
        );

        Ok(address)
    }

    /// Drop `token` for the user from the cache and the backing store.
    ///
    /// A different token registered in the meantime is kept. The cache entry
    /// is evicted first, so later lookups re-resolve even if the store write
    /// fails.
    pub async fn invalidate(&self, user_id: &UserId, token: &str) -> Result<(), DirectoryError> {
        self.evict_token(user_id, token).await;
        let cleared = self.store.invalidate(user_id, token).await;
        // Lookups that read the store before the write landed must not cache.
        self.cache.write().await.bump(user_id);

        if cleared? {
            tracing::info!(user_id = %user_id, "Invalidated device token");
        } else {
            tracing::info!(
                user_id = %user_id,
                "Device token already replaced, nothing to invalidate"
            );
        }
        Ok(())
    }

    /// Register a new token for a user and refresh the cache with it.
    pub async fn register(&self, user_id: &UserId, token: &str) -> Result<DeliveryAddress, DirectoryError> {
        if user_id.is_empty() {
            return Err(DirectoryError::EmptyUserId);
        }
        let address = self.store.register(user_id, token).await?;
        let mut cache = self.cache.write().await;
        cache.bump(user_id);
        cache.entries.insert(
            user_id.clone(),
            CachedAddress {
                address: address.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(address)
    }

    /// Drop the cache entry if it still holds `token`.
    async fn evict_token(&self, user_id: &UserId, token: &str) {
        let mut cache = self.cache.write().await;
        cache.bump(user_id);
        if cache
            .entries
            .get(user_id)
            .is_some_and(|cached| cached.address.token == token)
        {
            cache.entries.remove(user_id);
        }
    }

    /// Whether the user currently has a cached address.
    pub async fn is_cached(&self, user_id: &UserId) -> bool {
        self.cache.read().await.entries.contains_key(user_id)
    }

    /// Number of cached addresses (for monitoring).
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.entries.len()
    }
}

/// Postgres-backed address store over `users.fcm_token`.
pub struct PgAddressStore {
    pool: PgPool,
}

impl PgAddressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AddressStore for PgAddressStore {
    async fn get_address_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<DeliveryAddress>, DirectoryError> {
        let row: Option<(Option<String>, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT fcm_token, token_updated_at FROM users WHERE id = $1")
                .bind(user_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(token, updated_at)| {
            let token = token.filter(|t| !t.is_empty())?;
            Some(DeliveryAddress {
                token,
                user_id: user_id.clone(),
                last_refreshed_at: updated_at.unwrap_or_else(Utc::now),
            })
        }))
    }

    async fn invalidate(&self, user_id: &UserId, token: &str) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET fcm_token = NULL, token_updated_at = NOW()
            WHERE id = $1 AND fcm_token = $2
            "#,
        )
        .bind(user_id.as_str())
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn register(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> Result<DeliveryAddress, DirectoryError> {
        let (updated_at,): (DateTime<Utc>,) = sqlx::query_as(
            r#"
            INSERT INTO users (id, fcm_token, token_updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
                SET fcm_token = EXCLUDED.fcm_token,
                    token_updated_at = EXCLUDED.token_updated_at
            RETURNING token_updated_at
            "#,
        )
        .bind(user_id.as_str())
        .bind(token)
        .fetch_one(&self.pool)
        .await?;

        Ok(DeliveryAddress {
            token: token.to_string(),
            user_id: user_id.clone(),
            last_refreshed_at: updated_at,
        })
    }
}

/// In-memory address store for tests and local runs.
#[derive(Default)]
pub struct InMemoryAddressStore {
    addresses: Mutex<HashMap<UserId, DeliveryAddress>>,
    lookups: AtomicUsize,
    invalidations: AtomicUsize,
}

impl InMemoryAddressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a token for a user.
    pub async fn insert(&self, user_id: impl Into<String>, token: impl Into<String>) {
        let user_id = UserId::new(user_id);
        self.addresses.lock().await.insert(
            user_id.clone(),
            DeliveryAddress {
                token: token.into(),
                user_id,
                last_refreshed_at: Utc::now(),
            },
        );
    }

    /// Number of backing-store lookups served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of invalidations received.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressStore for InMemoryAddressStore {
    async fn get_address_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<DeliveryAddress>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.addresses.lock().await.get(user_id).cloned())
    }

    async fn invalidate(&self, user_id: &UserId, token: &str) -> Result<bool, DirectoryError> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        let mut addresses = self.addresses.lock().await;
        if addresses.get(user_id).is_some_and(|a| a.token == token) {
            addresses.remove(user_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn register(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> Result<DeliveryAddress, DirectoryError> {
        let address = DeliveryAddress {
            token: token.to_string(),
            user_id: user_id.clone(),
            last_refreshed_at: Utc::now(),
        };
        self.addresses
            .lock()
            .await
            .insert(user_id.clone(), address.clone());
        Ok(address)
    }
}
