//! Integration tests for the feed poller against PostgreSQL.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p courier-ingestor --test integration -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use courier_common::types::{DeliveryOutcome, NotificationId};
use courier_engine::{
    DispatchConfig, DispatchEngine, InMemoryOutcomeStore, PgAddressStore, RecipientDirectory,
    RetryPolicy,
};
use courier_ingestor::feed::FeedPoller;
use courier_ingestor::normalize::EventIngestor;
use courier_notifier::LogTransport;

/// Create an engine over the test database and a poller feeding it.
async fn setup(pool: &PgPool) -> (Arc<DispatchEngine>, FeedPoller) {
    // Run migrations
    sqlx::migrate!("../../migrations").run(pool).await.unwrap();

    // Clean up any leftover data from previous runs
    sqlx::query("DELETE FROM photo_events").execute(pool).await.unwrap();
    sqlx::query("DELETE FROM feed_state").execute(pool).await.unwrap();
    sqlx::query("DELETE FROM users").execute(pool).await.unwrap();

    let config = DispatchConfig {
        retry: RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::ZERO,
        ),
        ..Default::default()
    };
    let engine = Arc::new(DispatchEngine::new(
        Arc::new(RecipientDirectory::new(Arc::new(PgAddressStore::new(pool.clone())))),
        Arc::new(LogTransport::new()),
        Arc::new(InMemoryOutcomeStore::new()),
        config,
    ));

    let poller = FeedPoller::new(pool.clone(), engine.clone(), EventIngestor::new(), 10, 10, 4);
    (engine, poller)
}

async fn insert_user(pool: &PgPool, id: &str, token: Option<&str>) {
    sqlx::query("INSERT INTO users (id, fcm_token, token_updated_at) VALUES ($1, $2, NOW())")
        .bind(id)
        .bind(token)
        .execute(pool)
        .await
        .unwrap();
}

async fn insert_event(pool: &PgPool, path: &str, fields: serde_json::Value) {
    sqlx::query("INSERT INTO photo_events (document_path, fields) VALUES ($1, $2)")
        .bind(path)
        .bind(fields)
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn test_poll_once_dispatches_batch_and_advances_cursor(pool: PgPool) {
    let (engine, poller) = setup(&pool).await;
    insert_user(&pool, "u1", Some("tok-abc")).await;
    insert_user(&pool, "u2", None).await;

    insert_event(
        &pool,
        "categories/cat1/photos/photo42",
        serde_json::json!({ "userId": "u1", "imageUrl": "https://cdn.example/p42.jpg" }),
    )
    .await;
    insert_event(
        &pool,
        "categories/cat1/photos/photo43",
        serde_json::json!({ "userId": "u2", "imageUrl": "https://cdn.example/p43.jpg" }),
    )
    .await;
    insert_event(
        &pool,
        "categories/cat1/photos/photo44",
        serde_json::json!({ "imageUrl": "https://cdn.example/p44.jpg" }),
    )
    .await;

    let summary = poller.poll_once().await.unwrap().expect("batch expected");

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.unresolvable, 1);
    assert_eq!(summary.malformed, 1);
    assert_eq!(poller.get_cursor().await.unwrap(), Some(summary.last_seq));

    let record = engine
        .outcome(&NotificationId::new("cat1/photo42"))
        .await
        .expect("outcome recorded");
    assert_eq!(record.outcome, DeliveryOutcome::Sent);
    assert_eq!(record.attempts, 1);

    // Drained feed yields no batch
    assert!(poller.poll_once().await.unwrap().is_none());
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn test_replayed_rows_are_not_redelivered(pool: PgPool) {
    let (engine, poller) = setup(&pool).await;
    insert_user(&pool, "u1", Some("tok-abc")).await;

    let fields = serde_json::json!({ "userId": "u1", "imageUrl": "https://cdn.example/p42.jpg" });
    insert_event(&pool, "categories/cat1/photos/photo42", fields.clone()).await;
    poller.poll_once().await.unwrap();

    // The feed redelivers the same document
    insert_event(&pool, "categories/cat1/photos/photo42", fields).await;
    let summary = poller.poll_once().await.unwrap().expect("batch expected");

    assert_eq!(summary.sent, 1);
    let record = engine
        .outcome(&NotificationId::new("cat1/photo42"))
        .await
        .unwrap();
    assert_eq!(record.attempts, 1, "settled outcome reused, no second send");
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn test_cursor_held_back_after_shutdown(pool: PgPool) {
    let (engine, poller) = setup(&pool).await;
    insert_user(&pool, "u1", Some("tok-abc")).await;
    insert_event(
        &pool,
        "categories/cat1/photos/photo42",
        serde_json::json!({ "userId": "u1", "imageUrl": "https://cdn.example/p42.jpg" }),
    )
    .await;

    engine.shutdown();
    poller.poll_once().await.unwrap();

    assert_eq!(poller.get_cursor().await.unwrap(), None);
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn test_cursor_round_trip(pool: PgPool) {
    let (_engine, poller) = setup(&pool).await;
    let poller = poller.with_feed_name("test_feed");

    assert_eq!(poller.get_cursor().await.unwrap(), None);
    poller.set_cursor(41).await.unwrap();
    poller.set_cursor(42).await.unwrap();
    assert_eq!(poller.get_cursor().await.unwrap(), Some(42));
}
