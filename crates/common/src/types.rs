use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Idempotency key of a notification.
///
/// Derived from the source event's own identifier, so re-delivery of the
/// same upstream record collapses onto the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub String);

impl NotificationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical user identifier (the owner of the device tokens).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized notification, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: NotificationId,
    pub recipient_user_id: UserId,
    pub title: String,
    pub body: String,
    /// Data fields forwarded to the device alongside the visible notification.
    pub payload: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A registered device token for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAddress {
    pub token: String,
    pub user_id: UserId,
    pub last_refreshed_at: DateTime<Utc>,
}

/// Result of dispatching one notification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    RecipientUnresolvable,
    TransientFailure,
    PermanentFailure,
}

impl DeliveryOutcome {
    /// Whether a stored outcome closes the id for good.
    ///
    /// `TransientFailure` ends one submission only; a recurring upstream
    /// event may be admitted again.
    pub fn is_final(self) -> bool {
        !matches!(self, DeliveryOutcome::TransientFailure)
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Sent => write!(f, "sent"),
            DeliveryOutcome::RecipientUnresolvable => write!(f, "recipient_unresolvable"),
            DeliveryOutcome::TransientFailure => write!(f, "transient_failure"),
            DeliveryOutcome::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

/// Stored outcome of a dispatch, keyed by `NotificationId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub outcome: DeliveryOutcome,
    /// Number of delivery attempts made in the settling submission.
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// Message identifier returned by the push provider on success.
    pub provider_message_id: Option<String>,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(outcome: DeliveryOutcome, attempts: u32, elapsed_ms: u64) -> Self {
        Self {
            outcome,
            attempts,
            elapsed_ms,
            provider_message_id: None,
            last_error: None,
            recorded_at: Utc::now(),
        }
    }
}

/// One record from the upstream change feed, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Path of the created document, e.g. `categories/cat1/photos/photo42`.
    pub document_path: String,
    /// Document fields as delivered by the feed.
    pub fields: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_finality() {
        assert!(DeliveryOutcome::Sent.is_final());
        assert!(DeliveryOutcome::PermanentFailure.is_final());
        assert!(DeliveryOutcome::RecipientUnresolvable.is_final());
        assert!(!DeliveryOutcome::TransientFailure.is_final());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&DeliveryOutcome::RecipientUnresolvable).unwrap();
        assert_eq!(json, "\"recipient_unresolvable\"");
        assert_eq!(
            DeliveryOutcome::RecipientUnresolvable.to_string(),
            "recipient_unresolvable"
        );
    }

    #[test]
    fn test_blank_user_id_is_empty() {
        assert!(UserId::new("").is_empty());
        assert!(UserId::new("   ").is_empty());
        assert!(!UserId::new("u1").is_empty());
    }

    #[test]
    fn test_raw_event_created_at_optional() {
        let raw: RawEvent = serde_json::from_value(serde_json::json!({
            "document_path": "categories/c/photos/p",
            "fields": { "userId": "u1" }
        }))
        .unwrap();
        assert!(raw.created_at.is_none());
        assert_eq!(raw.fields["userId"], "u1");
    }
}
