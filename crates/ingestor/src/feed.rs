use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use courier_common::types::{DeliveryOutcome, RawEvent};
use courier_engine::DispatchEngine;

use crate::normalize::EventIngestor;

/// Counts for one polled batch of feed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Highest feed sequence number in the batch.
    pub last_seq: i64,
    pub fetched: usize,
    pub malformed: usize,
    pub sent: usize,
    pub unresolvable: usize,
    pub transient: usize,
    pub permanent: usize,
}

impl BatchSummary {
    fn count(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::RecipientUnresolvable => self.unresolvable += 1,
            DeliveryOutcome::TransientFailure => self.transient += 1,
            DeliveryOutcome::PermanentFailure => self.permanent += 1,
        }
    }
}

/// Change-feed poller that turns `photo_events` rows into dispatches.
///
/// Rows are read in sequence order past the feed cursor stored in
/// `feed_state`. Every row of a batch is submitted to the engine, with at most
/// `concurrency` submissions in flight. The cursor only advances once the whole
/// batch has settled, so a crash replays the batch and the engine's idempotency
/// store absorbs the duplicates.
pub struct FeedPoller {
    pool: PgPool,
    engine: Arc<DispatchEngine>,
    ingestor: EventIngestor,
    feed: String,
    poll_interval: Duration,
    batch_size: u32,
    permits: Arc<Semaphore>,
}

impl FeedPoller {
    pub fn new(
        pool: PgPool,
        engine: Arc<DispatchEngine>,
        ingestor: EventIngestor,
        poll_interval_ms: u64,
        batch_size: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            pool,
            engine,
            ingestor,
            feed: "photo_events".to_string(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size: batch_size.max(1),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Name the cursor row in `feed_state` (defaults to `photo_events`).
    pub fn with_feed_name(mut self, feed: impl Into<String>) -> Self {
        self.feed = feed.into();
        self
    }

    /// Start the polling loop. Runs until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            feed = %self.feed,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Feed poller started"
        );

        while !*shutdown.borrow() {
            let caught_up = match self.poll_once().await {
                Ok(Some(summary)) => {
                    tracing::info!(
                        feed = %self.feed,
                        last_seq = summary.last_seq,
                        fetched = summary.fetched,
                        malformed = summary.malformed,
                        sent = summary.sent,
                        unresolvable = summary.unresolvable,
                        transient = summary.transient,
                        permanent = summary.permanent,
                        "Processed feed batch"
                    );
                    summary.fetched < self.batch_size as usize
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(feed = %self.feed, error = %e, "Feed poll failed");
                    true
                }
            };

            if caught_up {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(feed = %self.feed, "Feed poller stopped");
        Ok(())
    }

    /// Fetch and dispatch one batch. Returns `None` when the feed is drained.
    pub async fn poll_once(&self) -> anyhow::Result<Option<BatchSummary>> {
        let cursor = self.get_cursor().await?.unwrap_or(0);

        let rows: Vec<(i64, String, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT seq, document_path, fields, created_at
            FROM photo_events
            WHERE seq > $1
            ORDER BY seq
            LIMIT $2
            "#,
        )
        .bind(cursor)
        .bind(self.batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let Some(last_seq) = rows.last().map(|(seq, ..)| *seq) else {
            return Ok(None);
        };

        let mut summary = BatchSummary {
            last_seq,
            fetched: rows.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for (seq, document_path, fields, created_at) in rows {
            let raw = RawEvent {
                document_path,
                fields,
                created_at: Some(created_at),
            };
            let request = match self.ingestor.ingest(&raw) {
                Ok(request) => request,
                Err(_) => {
                    summary.malformed += 1;
                    continue;
                }
            };

            let permit = self.permits.clone().acquire_owned().await?;
            let engine = self.engine.clone();
            tasks.spawn(async move {
                let _permit = permit;
                tracing::debug!(seq, request_id = %request.id, "Dispatching feed event");
                engine.submit(request).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.count(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch task failed");
                    summary.transient += 1;
                }
            }
        }

        // Submissions cut short by shutdown were released unrecorded; leave the
        // cursor behind them so the next run picks them up again.
        if self.engine.is_running() {
            self.set_cursor(last_seq).await?;
        } else {
            tracing::info!(
                feed = %self.feed,
                cursor,
                "Shutdown during batch, cursor not advanced"
            );
        }

        Ok(Some(summary))
    }

    /// Last processed feed sequence number.
    pub async fn get_cursor(&self) -> anyhow::Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT last_seq FROM feed_state WHERE feed = $1")
            .bind(&self.feed)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(seq,)| seq))
    }

    /// Persist the feed cursor.
    pub async fn set_cursor(&self, last_seq: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_state (feed, last_seq)
            VALUES ($1, $2)
            ON CONFLICT (feed) DO UPDATE SET last_seq = $2, updated_at = NOW()
            "#,
        )
        .bind(&self.feed)
        .bind(last_seq)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_outcomes() {
        let mut summary = BatchSummary::default();
        summary.count(DeliveryOutcome::Sent);
        summary.count(DeliveryOutcome::Sent);
        summary.count(DeliveryOutcome::RecipientUnresolvable);
        summary.count(DeliveryOutcome::TransientFailure);
        summary.count(DeliveryOutcome::PermanentFailure);

        assert_eq!(summary.sent, 2);
        assert_eq!(summary.unresolvable, 1);
        assert_eq!(summary.transient, 1);
        assert_eq!(summary.permanent, 1);
    }
}
