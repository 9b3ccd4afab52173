//! Dispatch engine: the only component allowed to attempt a delivery.
//!
//! For each submitted request:
//! 1. Admission: claim the id in the outcome store; a stored final outcome is
//!    returned as-is, a submission already in flight is awaited
//! 6. Invalidation: an invalid-token rejection drops the refused token
//! 3. Delivery: hand the message to the transport
//! 4. Classification: only transient transport failures are retried
//! 5. Retry: exponential backoff with jitter, bounded attempt count, same id
//! 6. Invalidation: an invalid-token rejection evicts the user's address
//!
//! `submit` never fails: every path ends in a `DeliveryOutcome`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};

use courier_common::config::AppConfig;
use courier_common::types::{DeliveryOutcome, DeliveryRecord, NotificationId, NotificationRequest};
use courier_notifier::{DeliveryReceipt, DeliveryTransport, TransportError};

use crate::directory::{DirectoryError, RecipientDirectory};
use crate::retry::RetryPolicy;
use crate::store::{Claim, ClaimToken, OutcomeStore};

/// Tuning knobs of the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Delivery attempts per submission, including the first.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    pub resolve_timeout: Duration,
    pub send_timeout: Duration,
    /// Lease on an in-flight id; must outlast a full attempt sequence.
    pub claim_lease: Duration,
    /// How long to wait on a submission held by another worker.
    pub inflight_wait: Duration,
    pub inflight_poll_interval: Duration,
}

/// Slack on top of the worst-case attempt sequence for invalidation and
/// outcome recording.
const CLAIM_LEASE_MARGIN: Duration = Duration::from_secs(5);

impl DispatchConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let mut dispatch = Self {
            max_attempts: config.dispatch_max_attempts.max(1),
            retry: RetryPolicy::from_app_config(config),
            resolve_timeout: Duration::from_millis(config.resolve_timeout_ms),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            claim_lease: Duration::from_secs(config.claim_lease_secs),
            ..Self::default()
        }
        .with_safe_claim_lease();
        dispatch.inflight_wait = dispatch.claim_lease;
        dispatch
    }

    /// Longest a single submission can hold its claim: every attempt hitting
    /// both timeouts, plus every backoff at full jitter.
    pub fn worst_case_sequence(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts)
            .map(|n| self.retry.base_delay(n) + self.retry.jitter)
            .sum();
        (self.resolve_timeout + self.send_timeout) * attempts + backoff
    }

    /// Raise `claim_lease` to cover the worst-case attempt sequence.
    ///
    /// A lease that expires mid-sequence lets another worker claim the id and
    /// send a second time.
    pub fn with_safe_claim_lease(mut self) -> Self {
        let minimum = self.worst_case_sequence() + CLAIM_LEASE_MARGIN;
        if self.claim_lease < minimum {
            tracing::warn!(
                configured_ms = self.claim_lease.as_millis() as u64,
                minimum_ms = minimum.as_millis() as u64,
                "Claim lease shorter than worst-case dispatch, raising it"
            );
            self.claim_lease = minimum;
        }
        self
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry: RetryPolicy::default(),
            resolve_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(5),
            claim_lease: Duration::from_secs(120),
            inflight_wait: Duration::from_secs(120),
            inflight_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Result of one resolve + send attempt.
enum Attempt {
    Delivered(DeliveryReceipt),
    Unresolvable,
    Transient(String),
    /// Carries the token the provider refused.
    Permanent { error: TransportError, token: String },
}

/// Summary of an attempt sequence.
struct Settlement {
    outcome: DeliveryOutcome,
    attempts: u32,
    provider_message_id: Option<String>,
    last_error: Option<String>,
    cancelled: bool,
}

impl Settlement {
    fn new(outcome: DeliveryOutcome, attempts: u32) -> Self {
        Self {
            outcome,
            attempts,
            provider_message_id: None,
            last_error: None,
            cancelled: false,
        }
    }
}

type InflightMap = Mutex<HashMap<NotificationId, watch::Receiver<Option<DeliveryOutcome>>>>;

/// Removes the in-process in-flight marker when a submission ends, including
/// when its future is dropped mid-flight.
struct InflightGuard<'a> {
    inflight: &'a InflightMap,
    id: NotificationId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Push-notification dispatch engine.
pub struct DispatchEngine {
    directory: Arc<RecipientDirectory>,
    transport: Arc<dyn DeliveryTransport>,
    store: Arc<dyn OutcomeStore>,
    config: DispatchConfig,
    inflight: InflightMap,
    shutdown_tx: watch::Sender<bool>,
}

impl DispatchEngine {
    pub fn new(
        directory: Arc<RecipientDirectory>,
        transport: Arc<dyn DeliveryTransport>,
        store: Arc<dyn OutcomeStore>,
        config: DispatchConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            directory,
            transport,
            store,
            config,
            inflight: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn directory(&self) -> &Arc<RecipientDirectory> {
        &self.directory
    }

    /// Dispatch a notification request and return its outcome.
    ///
    /// Concurrent submissions of the same id in this process share one
    /// attempt sequence; across processes the outcome store's lease keeps a
    /// single sequence in flight.
    pub async fn submit(&self, request: NotificationRequest) -> DeliveryOutcome {
        let registered = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&request.id) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(request.id.clone(), rx);
                    Ok(tx)
                }
            }
        };

        let tx = match registered {
            Ok(tx) => tx,
            Err(rx) => {
                tracing::debug!(request_id = %request.id, "Joining in-flight dispatch");
                return Self::await_inflight(rx).await;
            }
        };
        let _guard = InflightGuard {
            inflight: &self.inflight,
            id: request.id.clone(),
        };

        let outcome = self.admit_and_dispatch(&request).await;
        tx.send_replace(Some(outcome));
        outcome
    }

    /// Stored record for an id, if any.
    pub async fn outcome(&self, id: &NotificationId) -> Option<DeliveryRecord> {
        match self.store.load(id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Failed to load stored outcome");
                None
            }
        }
    }

    /// Stop retrying: submissions waiting in backoff give up their lease and
    /// return without recording.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        tracing::info!("Dispatch engine shutting down");
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    async fn await_inflight(mut rx: watch::Receiver<Option<DeliveryOutcome>>) -> DeliveryOutcome {
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).unwrap_or(DeliveryOutcome::TransientFailure),
            // The owning submission was dropped before settling.
            Err(_) => DeliveryOutcome::TransientFailure,
        }
    }

    async fn admit_and_dispatch(&self, request: &NotificationRequest) -> DeliveryOutcome {
        let started = Instant::now();
        let admitted_at = Utc::now();
        let deadline = started + self.config.inflight_wait;

        let token = loop {
            match self.store.claim(&request.id, self.config.claim_lease).await {
                Ok(Claim::Acquired(token)) => break token,
                Ok(Claim::Settled(record)) => {
                    tracing::debug!(
                        request_id = %request.id,
                        outcome = %record.outcome,
                        "Duplicate submission — returning stored outcome"
                    );
                    return record.outcome;
                }
                Ok(Claim::InFlight) => {}
                Err(e) => {
                    tracing::error!(
                        request_id = %request.id,
                        error = %e,
                        "Outcome store unavailable — refusing to dispatch without admission"
                    );
                    return DeliveryOutcome::TransientFailure;
                }
            }

            if Instant::now() >= deadline
                || !self.wait_or_shutdown(self.config.inflight_poll_interval).await
            {
                tracing::warn!(
                    request_id = %request.id,
                    "Submission still in flight elsewhere — giving up wait"
                );
                return DeliveryOutcome::TransientFailure;
            }

            // A transient settlement elsewhere releases the lease without
            // blocking new claims; report it instead of starting over.
            if let Ok(Some(record)) = self.store.load(&request.id).await
                && record.recorded_at >= admitted_at
            {
                return record.outcome;
            }
        };

        let settlement = self.run_attempts(request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if settlement.cancelled {
            self.release(&request.id, &token).await;
            tracing::info!(
                request_id = %request.id,
                attempt_count = settlement.attempts,
                elapsed_ms,
                "Dispatch cancelled by shutdown — lease released"
            );
            return DeliveryOutcome::TransientFailure;
        }

        let mut record = DeliveryRecord::new(settlement.outcome, settlement.attempts, elapsed_ms);
        record.provider_message_id = settlement.provider_message_id;
        record.last_error = settlement.last_error;

        if let Err(e) = self.store.record(&request.id, &token, &record).await {
            tracing::error!(
                request_id = %request.id,
                outcome = %record.outcome,
                error = %e,
                "Failed to record dispatch outcome"
            );
        }

        if record.outcome == DeliveryOutcome::Sent {
            tracing::info!(
                request_id = %request.id,
                outcome = %record.outcome,
                attempt_count = record.attempts,
                elapsed_ms,
                "Notification dispatch settled"
            );
        } else {
            tracing::warn!(
                request_id = %request.id,
                outcome = %record.outcome,
                attempt_count = record.attempts,
                elapsed_ms,
                last_error = record.last_error.as_deref().unwrap_or(""),
                "Notification dispatch settled"
            );
        }

        record.outcome
    }

    async fn run_attempts(&self, request: &NotificationRequest) -> Settlement {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.attempt(request).await {
                Attempt::Delivered(receipt) => {
                    let mut settlement = Settlement::new(DeliveryOutcome::Sent, attempt);
                    settlement.provider_message_id = Some(receipt.message_id);
                    return settlement;
                }
                Attempt::Unresolvable => {
                    return Settlement::new(DeliveryOutcome::RecipientUnresolvable, attempt);
                }
                Attempt::Permanent { error: err, token } => {
                    if err.is_invalid_token() {
                        self.invalidate_recipient(request, &token).await;
                    }
                    let mut settlement = Settlement::new(DeliveryOutcome::PermanentFailure, attempt);
                    settlement.last_error = Some(err.to_string());
                    return settlement;
                }
                Attempt::Transient(reason) => {
                    if attempt >= max_attempts {
                        let mut settlement =
                            Settlement::new(DeliveryOutcome::TransientFailure, attempt);
                        settlement.last_error = Some(reason);
                        return settlement;
                    }

                    let delay = self.config.retry.delay_for_attempt(attempt);
                    tracing::debug!(
                        request_id = %request.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient delivery failure — backing off"
                    );

                    if !self.wait_or_shutdown(delay).await {
                        let mut settlement =
                            Settlement::new(DeliveryOutcome::TransientFailure, attempt);
                        settlement.last_error = Some(reason);
                        settlement.cancelled = true;
                        return settlement;
                    }
                }
            }
        }
    }

    async fn attempt(&self, request: &NotificationRequest) -> Attempt {
        let resolved = timeout(
            self.config.resolve_timeout,
            self.directory.resolve(&request.recipient_user_id),
        )
        .await;

        let address = match resolved {
            Err(_) => return Attempt::Transient("recipient lookup timed out".to_string()),
            Ok(Err(DirectoryError::EmptyUserId)) | Ok(Ok(None)) => return Attempt::Unresolvable,
            Ok(Err(e)) => return Attempt::Transient(e.to_string()),
            Ok(Ok(Some(address))) => address,
        };

        let sent = timeout(
            self.config.send_timeout,
            self.transport.send(
                &address.token,
                &request.title,
                &request.body,
                &request.payload,
            ),
        )
        .await;

        match sent {
            Err(_) => Attempt::Transient(format!("{} send timed out", self.transport.name())),
            Ok(Ok(receipt)) => Attempt::Delivered(receipt),
            Ok(Err(e)) if e.is_transient() => Attempt::Transient(e.to_string()),
            Ok(Err(e)) => Attempt::Permanent {
                error: e,
                token: address.token,
            },
        }
    }

    async fn invalidate_recipient(&self, request: &NotificationRequest, token: &str) {
        if let Err(e) = self
            .directory
            .invalidate(&request.recipient_user_id, token)
            .await
        {
            tracing::warn!(
                request_id = %request.id,
                user_id = %request.recipient_user_id,
                error = %e,
                "Failed to invalidate device token in store"
            );
        }
    }

    async fn release(&self, id: &NotificationId, token: &ClaimToken) {
        if let Err(e) = self.store.release(id, token).await {
            tracing::warn!(request_id = %id, error = %e, "Failed to release dispatch lease");
        }
    }

    /// Sleep for `delay`; returns `false` if shutdown was requested first.
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = sleep(delay) => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(claim_lease: Duration) -> DispatchConfig {
        DispatchConfig {
            max_attempts: 3,
            retry: RetryPolicy::new(
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_millis(50),
            ),
            resolve_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(2),
            claim_lease,
            ..Default::default()
        }
    }

    #[test]
    fn test_worst_case_sequence() {
        // 3 × (1s + 2s) + (100ms + 50ms) + (200ms + 50ms)
        assert_eq!(
            config(Duration::ZERO).worst_case_sequence(),
            Duration::from_millis(9_400)
        );
    }

    #[test]
    fn test_short_claim_lease_is_raised() {
        let raised = config(Duration::from_secs(2)).with_safe_claim_lease();
        assert_eq!(raised.claim_lease, Duration::from_millis(9_400) + CLAIM_LEASE_MARGIN);
    }

    #[test]
    fn test_long_claim_lease_is_kept() {
        let kept = config(Duration::from_secs(120)).with_safe_claim_lease();
        assert_eq!(kept.claim_lease, Duration::from_secs(120));
    }

    #[test]
    fn test_default_lease_covers_default_sequence() {
        let defaults = DispatchConfig::default();
        assert!(defaults.claim_lease > defaults.worst_case_sequence());
    }
}
