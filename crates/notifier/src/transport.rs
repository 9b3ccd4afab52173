use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Acknowledgement returned by the push provider for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Provider-assigned message identifier, used to trace the delivery.
    pub message_id: String,
}

/// Why the provider refused a message for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentReason {
    /// The device token is unknown or no longer registered.
    InvalidToken,
    /// The message itself was rejected (bad field, oversized data, ...).
    MalformedPayload,
    /// The provider refused the sender (credentials, quota project, ...).
    Rejected,
}

impl std::fmt::Display for PermanentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermanentReason::InvalidToken => write!(f, "invalid_token"),
            PermanentReason::MalformedPayload => write!(f, "malformed_payload"),
            PermanentReason::Rejected => write!(f, "rejected"),
        }
    }
}

/// Failure of a single send, tagged by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Overload, timeout, rate limiting or a dropped connection.
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("permanent transport failure ({reason}): {detail}")]
    Permanent {
        reason: PermanentReason,
        detail: String,
    },
}

impl TransportError {
    pub fn transient(detail: impl Into<String>) -> Self {
        TransportError::Transient(detail.into())
    }

    pub fn permanent(reason: PermanentReason, detail: impl Into<String>) -> Self {
        TransportError::Permanent {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    pub fn is_invalid_token(&self) -> bool {
        matches!(
            self,
            TransportError::Permanent {
                reason: PermanentReason::InvalidToken,
                ..
            }
        )
    }
}

/// Boundary over the push provider.
///
/// Called only by the dispatch engine; implementations must not retry on
/// their own, the engine owns the retry policy.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(
        &self,
        token: &str,
        title: &str,
        body: &str,
        payload: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt, TransportError>;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = TransportError::transient("503");
        assert!(transient.is_transient());
        assert!(!transient.is_invalid_token());

        let invalid = TransportError::permanent(PermanentReason::InvalidToken, "UNREGISTERED");
        assert!(!invalid.is_transient());
        assert!(invalid.is_invalid_token());

        let malformed = TransportError::permanent(PermanentReason::MalformedPayload, "bad data");
        assert!(!malformed.is_invalid_token());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::permanent(PermanentReason::InvalidToken, "UNREGISTERED");
        assert_eq!(
            err.to_string(),
            "permanent transport failure (invalid_token): UNREGISTERED"
        );
    }
}
