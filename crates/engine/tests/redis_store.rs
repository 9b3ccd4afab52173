//! Integration tests for the Redis outcome store.
//!
//! Requires a running Redis server (`REDIS_URL`, default
//! `redis://localhost:6379`). Run with:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379" \
//!   cargo test -p courier-engine --test redis_store -- --ignored --nocapture
//! ```

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::types::{DeliveryOutcome, DeliveryRecord, NotificationId};
use courier_engine::{Claim, ClaimToken, OutcomeStore, RedisOutcomeStore};

const LEASE: Duration = Duration::from_secs(30);

// ============================================================
// Helpers
// ============================================================

async fn connect() -> ConnectionManager {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    redis::Client::open(url)
        .unwrap()
        .get_connection_manager()
        .await
        .unwrap()
}

/// Store under a fresh key prefix so runs never see each other's keys.
async fn setup() -> (RedisOutcomeStore, ConnectionManager, String) {
    let redis = connect().await;
    let prefix = format!("courier:test:{}", Uuid::new_v4());
    let store = RedisOutcomeStore::new(redis.clone(), prefix.clone(), Duration::from_secs(60));
    (store, redis, prefix)
}

fn id() -> NotificationId {
    NotificationId::new("cat1/photo42")
}

fn acquired(claim: Claim) -> ClaimToken {
    match claim {
        Claim::Acquired(token) => token,
        other => panic!("expected Acquired, got {:?}", other),
    }
}

async fn claim_holder(redis: &mut ConnectionManager, prefix: &str) -> Option<String> {
    redis
        .get(format!("{}:claim:{}", prefix, id()))
        .await
        .unwrap()
}

// ============================================================
// Claim / record / release
// ============================================================

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_second_claim_is_in_flight() {
    let (store, _redis, _prefix) = setup().await;

    acquired(store.claim(&id(), LEASE).await.unwrap());

    assert_eq!(store.claim(&id(), LEASE).await.unwrap(), Claim::InFlight);
}

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_final_record_settles_and_drops_lease() {
    let (store, mut redis, prefix) = setup().await;
    let token = acquired(store.claim(&id(), LEASE).await.unwrap());

    let record = DeliveryRecord::new(DeliveryOutcome::Sent, 1, 12);
    store.record(&id(), &token, &record).await.unwrap();

    assert_eq!(claim_holder(&mut redis, &prefix).await, None);
    assert_eq!(store.load(&id()).await.unwrap(), Some(record.clone()));

    // The lease is free, so the next claim takes it, sees the settled
    // outcome and hands the lease straight back.
    assert_eq!(
        store.claim(&id(), LEASE).await.unwrap(),
        Claim::Settled(record)
    );
    assert_eq!(claim_holder(&mut redis, &prefix).await, None);
}

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_settled_while_lease_held_elsewhere() {
    let (store, mut redis, prefix) = setup().await;
    let token = acquired(store.claim(&id(), LEASE).await.unwrap());
    let record = DeliveryRecord::new(DeliveryOutcome::PermanentFailure, 1, 5);
    store.record(&id(), &token, &record).await.unwrap();

    // Another worker holds a fresh lease; the stored outcome still wins.
    let _: () = redis
        .set_ex(format!("{}:claim:{}", prefix, id()), "other-worker", 60)
        .await
        .unwrap();

    match store.claim(&id(), LEASE).await.unwrap() {
        Claim::Settled(stored) => assert_eq!(stored.outcome, DeliveryOutcome::PermanentFailure),
        other => panic!("expected Settled, got {:?}", other),
    }
    assert_eq!(
        claim_holder(&mut redis, &prefix).await.as_deref(),
        Some("other-worker")
    );
}

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_transient_record_allows_new_claim() {
    let (store, _redis, _prefix) = setup().await;
    let token = acquired(store.claim(&id(), LEASE).await.unwrap());
    let record = DeliveryRecord::new(DeliveryOutcome::TransientFailure, 5, 900);
    store.record(&id(), &token, &record).await.unwrap();

    acquired(store.claim(&id(), LEASE).await.unwrap());
    let stored = store.load(&id()).await.unwrap().unwrap();
    assert_eq!(stored.outcome, DeliveryOutcome::TransientFailure);
}

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_release_frees_the_id_without_record() {
    let (store, _redis, _prefix) = setup().await;
    let token = acquired(store.claim(&id(), LEASE).await.unwrap());

    store.release(&id(), &token).await.unwrap();

    assert!(store.load(&id()).await.unwrap().is_none());
    acquired(store.claim(&id(), LEASE).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_stale_token_cannot_release_or_record_over_new_lease() {
    let (store, mut redis, prefix) = setup().await;
    let old = acquired(store.claim(&id(), Duration::from_millis(50)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(120)).await;

    // The short lease expired, so a new owner takes over.
    let new = acquired(store.claim(&id(), LEASE).await.unwrap());

    store.release(&id(), &old).await.unwrap();
    assert_eq!(claim_holder(&mut redis, &prefix).await, Some(new.0.clone()));

    let late = DeliveryRecord::new(DeliveryOutcome::TransientFailure, 5, 900);
    store.record(&id(), &old, &late).await.unwrap();
    assert_eq!(claim_holder(&mut redis, &prefix).await, Some(new.0));
}

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_outcome_expires_after_retention() {
    let (store, mut redis, prefix) = setup().await;
    let token = acquired(store.claim(&id(), LEASE).await.unwrap());
    store
        .record(&id(), &token, &DeliveryRecord::new(DeliveryOutcome::Sent, 1, 3))
        .await
        .unwrap();

    let ttl: i64 = redis
        .ttl(format!("{}:outcome:{}", prefix, id()))
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 60, "unexpected TTL {}", ttl);
}
