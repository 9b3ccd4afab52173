//! Event normalization: turns a raw change-feed record into a
//! `NotificationRequest`.
//!
//! The notification id comes from the source document path, so redelivery
//! of the same record by the feed maps onto the same id:
//!
//! | document path | notification id |
//! |---|---|
//! | `categories/cat1/photos/photo42` | `cat1/photo42` |
//! | `/categories/cat1/photos/photo42/` | `cat1/photo42` |
//!
//! Only photo documents produce notifications. Any other path, a record
//! without a recipient (`userId`) or without any payload field is malformed:
//! it is logged and dropped, never retried.

use std::collections::BTreeMap;

use chrono::Utc;
use thiserror::Error;

use courier_common::types::{NotificationId, NotificationRequest, RawEvent, UserId};

/// Title used when the event does not carry one.
pub const DEFAULT_TITLE: &str = "사진이 업로드 되었습니다!";

/// Body used when the event does not carry one.
pub const DEFAULT_BODY: &str = "카테고리 사진이 추가되었습니다. 지금 확인하세요!";

/// Document field naming the recipient.
const RECIPIENT_FIELD: &str = "userId";

/// Fields forwarded as notification data by default.
const DEFAULT_PAYLOAD_FIELDS: &[&str] = &["imageUrl"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("malformed event: {reason}")]
    MalformedEvent { reason: String },
}

impl IngestError {
    fn malformed(reason: impl Into<String>) -> Self {
        IngestError::MalformedEvent {
            reason: reason.into(),
        }
    }
}

/// Normalizes raw feed events.
#[derive(Debug, Clone)]
pub struct EventIngestor {
    payload_fields: Vec<String>,
}

impl EventIngestor {
    pub fn new() -> Self {
        Self {
            payload_fields: DEFAULT_PAYLOAD_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Override the document fields forwarded as notification data.
    pub fn with_payload_fields(mut self, fields: &[&str]) -> Self {
        self.payload_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Normalize one raw event.
    pub fn ingest(&self, raw: &RawEvent) -> Result<NotificationRequest, IngestError> {
        let result = self.normalize(raw);
        if let Err(e) = &result {
            tracing::warn!(
                document_path = %raw.document_path,
                error = %e,
                "Dropping malformed event"
            );
        }
        result
    }

    fn normalize(&self, raw: &RawEvent) -> Result<NotificationRequest, IngestError> {
        let (category_id, photo_id) = photo_path(&raw.document_path).ok_or_else(|| {
            IngestError::malformed(format!(
                "document path {:?} is not categories/{{categoryId}}/photos/{{photoId}}",
                raw.document_path
            ))
        })?;

        let fields = raw
            .fields
            .as_object()
            .ok_or_else(|| IngestError::malformed("event fields are not an object"))?;

        let recipient = fields
            .get(RECIPIENT_FIELD)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::malformed("missing recipient userId"))?;

        let mut payload = BTreeMap::new();
        for name in &self.payload_fields {
            if let Some(value) = fields.get(name).and_then(|v| v.as_str())
                && !value.is_empty()
            {
                payload.insert(name.clone(), value.to_string());
            }
        }
        if payload.is_empty() {
            return Err(IngestError::malformed(format!(
                "no payload field present (expected one of: {})",
                self.payload_fields.join(", ")
            )));
        }

        payload.insert(RECIPIENT_FIELD.to_string(), recipient.to_string());
        payload.insert("categoryId".to_string(), category_id.to_string());
        payload.insert("photoId".to_string(), photo_id.to_string());

        let text = |key: &str, default: &str| {
            fields
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(default)
                .to_string()
        };

        Ok(NotificationRequest {
            id: photo_notification_id(category_id, photo_id),
            recipient_user_id: UserId::new(recipient),
            title: text("title", DEFAULT_TITLE),
            body: text("body", DEFAULT_BODY),
            payload,
            created_at: raw.created_at.unwrap_or_else(Utc::now),
        })
    }
}

impl Default for EventIngestor {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the idempotency key from a photo document path.
///
/// Returns `None` for anything that is not a photo document, so every id
/// maps back to exactly one `(categoryId, photoId)` pair.
pub fn notification_id(document_path: &str) -> Option<NotificationId> {
    photo_path(document_path).map(|(category_id, photo_id)| photo_notification_id(category_id, photo_id))
}

fn photo_notification_id(category_id: &str, photo_id: &str) -> NotificationId {
    NotificationId::new(format!("{}/{}", category_id, photo_id))
}

/// Split `categories/{categoryId}/photos/{photoId}` into its ids.
fn photo_path(document_path: &str) -> Option<(&str, &str)> {
    let segments: Vec<&str> = document_path.trim().trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["categories", category_id, "photos", photo_id]
            if !category_id.is_empty() && !photo_id.is_empty() =>
        {
            Some((category_id, photo_id))
        }
        _ => None,
    }
}
