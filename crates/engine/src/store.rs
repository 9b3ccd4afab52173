//! Outcome store: the idempotency record keyed by notification id.
//!
//! Admission and outcome recording go through compare-and-set operations:
//! - `claim` atomically takes the in-flight lease for an id unless a final
//!   outcome is already stored or another submission holds the lease
//! - `record` stores the outcome and drops the caller's lease
//! - `release` drops the lease without recording (cancelled submission)
//!
//! A stored `TransientFailure` does not block a new claim: the id stays
//! eligible for a fresh submission when the upstream event recurs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use courier_common::types::{DeliveryRecord, NotificationId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Proof of holding the in-flight lease for an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken(pub String);

impl ClaimToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Result of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the id until it records or releases.
    Acquired(ClaimToken),
    /// A final outcome is already stored.
    Settled(DeliveryRecord),
    /// Another submission holds the lease.
    InFlight,
}

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn claim(&self, id: &NotificationId, lease: Duration) -> Result<Claim, StoreError>;

    async fn record(
        &self,
        id: &NotificationId,
        token: &ClaimToken,
        record: &DeliveryRecord,
    ) -> Result<(), StoreError>;

    async fn release(&self, id: &NotificationId, token: &ClaimToken) -> Result<(), StoreError>;

    async fn load(&self, id: &NotificationId) -> Result<Option<DeliveryRecord>, StoreError>;
}

#[derive(Debug)]
struct Lease {
    token: ClaimToken,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct InMemoryState {
    leases: HashMap<NotificationId, Lease>,
    records: HashMap<NotificationId, DeliveryRecord>,
}

/// Single-process outcome store.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn claim(&self, id: &NotificationId, lease: Duration) -> Result<Claim, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(record) = state.records.get(id)
            && record.outcome.is_final()
        {
            return Ok(Claim::Settled(record.clone()));
        }

        if let Some(existing) = state.leases.get(id)
            && existing.expires_at > Instant::now()
        {
            return Ok(Claim::InFlight);
        }

        let token = ClaimToken::generate();
        state.leases.insert(
            id.clone(),
            Lease {
                token: token.clone(),
                expires_at: Instant::now() + lease,
            },
        );
        Ok(Claim::Acquired(token))
    }

    async fn record(
        &self,
        id: &NotificationId,
        token: &ClaimToken,
        record: &DeliveryRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.leases.get(id).is_some_and(|l| &l.token == token) {
            state.leases.remove(id);
        }
        state.records.insert(id.clone(), record.clone());
        Ok(())
    }

    async fn release(&self, id: &NotificationId, token: &ClaimToken) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.leases.get(id).is_some_and(|l| &l.token == token) {
            state.leases.remove(id);
        }
        Ok(())
    }

    async fn load(&self, id: &NotificationId) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(id).cloned())
    }
}

/// Write the outcome, then drop the lease if the caller still owns it.
const RECORD_SCRIPT: &str = r#"
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Drop the lease only if the caller still owns it.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed outcome store shared by every dispatch worker.
///
/// Leases use `SET key token NX PX lease`; outcomes are JSON strings kept for
/// the configured retention.
#[derive(Clone)]
pub struct RedisOutcomeStore {
    redis: ConnectionManager,
    prefix: String,
    retention: Duration,
}

impl RedisOutcomeStore {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>, retention: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            retention,
        }
    }

    fn claim_key(&self, id: &NotificationId) -> String {
        format!("{}:claim:{}", self.prefix, id)
    }

    fn outcome_key(&self, id: &NotificationId) -> String {
        format!("{}:outcome:{}", self.prefix, id)
    }

    async fn load_with(
        &self,
        redis: &mut ConnectionManager,
        id: &NotificationId,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let raw: Option<String> = redis.get(self.outcome_key(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OutcomeStore for RedisOutcomeStore {
    async fn claim(&self, id: &NotificationId, lease: Duration) -> Result<Claim, StoreError> {
        let mut redis = self.redis.clone();
        let token = ClaimToken::generate();
        let claim_key = self.claim_key(id);

        // SET key token NX PX lease
        // Returns Some("OK") if the lease was taken, None if it is held elsewhere
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&claim_key)
            .arg(&token.0)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async(&mut redis)
            .await?;

        // The outcome is written before a lease is dropped, so reading it
        // after taking the lease cannot miss a settled submission.
        let existing = self.load_with(&mut redis, id).await?;
        let settled = existing.filter(|r| r.outcome.is_final());

        match (acquired.is_some(), settled) {
            (true, Some(record)) => {
                self.release(id, &token).await?;
                Ok(Claim::Settled(record))
            }
            (true, None) => Ok(Claim::Acquired(token)),
            (false, Some(record)) => Ok(Claim::Settled(record)),
            (false, None) => Ok(Claim::InFlight),
        }
    }

    async fn record(
        &self,
        id: &NotificationId,
        token: &ClaimToken,
        record: &DeliveryRecord,
    ) -> Result<(), StoreError> {
        let mut redis = self.redis.clone();
        let payload = serde_json::to_string(record)?;

        let _: i64 = redis::Script::new(RECORD_SCRIPT)
            .key(self.claim_key(id))
            .key(self.outcome_key(id))
            .arg(&token.0)
            .arg(payload)
            .arg(self.retention.as_secs().max(1))
            .invoke_async(&mut redis)
            .await?;
        Ok(())
    }

    async fn release(&self, id: &NotificationId, token: &ClaimToken) -> Result<(), StoreError> {
        let mut redis = self.redis.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.claim_key(id))
            .arg(&token.0)
            .invoke_async(&mut redis)
            .await?;
        Ok(())
    }

    async fn load(&self, id: &NotificationId) -> Result<Option<DeliveryRecord>, StoreError> {
        let mut redis = self.redis.clone();
        self.load_with(&mut redis, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::DeliveryOutcome;

    const LEASE: Duration = Duration::from_secs(30);

    fn id() -> NotificationId {
        NotificationId::new("cat1/photo42")
    }

    fn acquired(claim: Claim) -> ClaimToken {
        match claim {
            Claim::Acquired(token) => token,
            other => panic!("expected Acquired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_claim_is_in_flight() {
        let store = InMemoryOutcomeStore::new();
        acquired(store.claim(&id(), LEASE).await.unwrap());
        assert_eq!(store.claim(&id(), LEASE).await.unwrap(), Claim::InFlight);
    }

    #[tokio::test]
    async fn test_final_record_settles_claims() {
        let store = InMemoryOutcomeStore::new();
        let token = acquired(store.claim(&id(), LEASE).await.unwrap());
        let record = DeliveryRecord::new(DeliveryOutcome::Sent, 1, 12);
        store.record(&id(), &token, &record).await.unwrap();

        match store.claim(&id(), LEASE).await.unwrap() {
            Claim::Settled(stored) => assert_eq!(stored.outcome, DeliveryOutcome::Sent),
            other => panic!("expected Settled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_record_allows_new_claim() {
        let store = InMemoryOutcomeStore::new();
        let token = acquired(store.claim(&id(), LEASE).await.unwrap());
        let record = DeliveryRecord::new(DeliveryOutcome::TransientFailure, 5, 900);
        store.record(&id(), &token, &record).await.unwrap();

        acquired(store.claim(&id(), LEASE).await.unwrap());
        let stored = store.load(&id()).await.unwrap().unwrap();
        assert_eq!(stored.outcome, DeliveryOutcome::TransientFailure);
    }

    #[tokio::test]
    async fn test_release_frees_the_id_without_record() {
        let store = InMemoryOutcomeStore::new();
        let token = acquired(store.claim(&id(), LEASE).await.unwrap());
        store.release(&id(), &token).await.unwrap();

        assert!(store.load(&id()).await.unwrap().is_none());
        acquired(store.claim(&id(), LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release_new_lease() {
        let store = InMemoryOutcomeStore::new();
        let old = acquired(store.claim(&id(), Duration::ZERO).await.unwrap());
        // The zero lease has already expired, so a new owner takes over.
        let _new = acquired(store.claim(&id(), LEASE).await.unwrap());

        store.release(&id(), &old).await.unwrap();

        assert_eq!(store.claim(&id(), LEASE).await.unwrap(), Claim::InFlight);
    }
}
