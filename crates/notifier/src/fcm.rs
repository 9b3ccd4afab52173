//! FCM HTTP v1 transport.
//!
//! Sends one message per call to `POST /v1/projects/{project}/messages:send`
//! and maps the provider's error envelope onto [`TransportError`]:
//!
//! | provider answer | classification |
//! |---|---|
//! | 2xx | receipt (`name` of the created message) |
//! | `UNREGISTERED`, `NOT_FOUND`, `SENDER_ID_MISMATCH` error code | permanent, invalid token |
//! | 404 without a token error code | permanent, rejected (wrong project) |
//! | 400 / `INVALID_ARGUMENT` naming the token | permanent, invalid token |
//! | other 400 | permanent, malformed payload |
//! | 401, 403, `THIRD_PARTY_AUTH_ERROR` | permanent, rejected |
//! | 429, 5xx, network errors | transient |

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::transport::{DeliveryReceipt, DeliveryTransport, PermanentReason, TransportError};

/// Default per-request timeout of the underlying HTTP client.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Push transport backed by Firebase Cloud Messaging.
pub struct FcmTransport {
    client: reqwest::Client,
    send_url: String,
    access_token: String,
}

impl FcmTransport {
    /// Build a transport for `project_id`.
    ///
    /// `endpoint` is the API base URL (`https://fcm.googleapis.com` in
    /// production). The access token is used as-is; refreshing it is the
    /// deployment's concern.
    pub fn new(
        endpoint: &str,
        project_id: &str,
        access_token: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                endpoint.trim_end_matches('/'),
                project_id
            ),
            access_token: access_token.into(),
        })
    }

    fn message_body(
        token: &str,
        title: &str,
        body: &str,
        payload: &BTreeMap<String, String>,
    ) -> serde_json::Value {
        json!({
            "message": {
                "token": token,
                "notification": {
                    "title": title,
                    "body": body,
                },
                "data": payload,
            }
        })
    }
}

#[async_trait]
impl DeliveryTransport for FcmTransport {
    async fn send(
        &self,
        token: &str,
        title: &str,
        body: &str,
        payload: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt, TransportError> {
        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(&self.access_token)
            .json(&Self::message_body(token, title, body, payload))
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::transient(format!("reading FCM response: {}", e)))?;

        if status.is_success() {
            let message_id = serde_json::from_str::<SendResponse>(&text)
                .map(|r| r.name)
                .unwrap_or_default();
            tracing::debug!(message_id = %message_id, "FCM accepted message");
            return Ok(DeliveryReceipt { message_id });
        }

        Err(classify_response(status.as_u16(), &text))
    }

    fn name(&self) -> &'static str {
        "fcm"
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

fn classify_request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::transient("FCM request timed out")
    } else if err.is_connect() {
        TransportError::transient(format!("FCM connection failed: {}", err))
    } else {
        TransportError::transient(format!("FCM request failed: {}", err))
    }
}

/// Classify a non-success FCM response.
pub fn classify_response(status: u16, body: &str) -> TransportError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let error = envelope.error;
    let fcm_code = error
        .details
        .iter()
        .find_map(|d| d.error_code.clone())
        .unwrap_or_default();
    let detail = if error.message.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {} {}: {}", status, error.status, error.message)
    };

    match (status, fcm_code.as_str()) {
        (_, "UNREGISTERED") | (_, "NOT_FOUND") | (_, "SENDER_ID_MISMATCH") => {
            TransportError::permanent(PermanentReason::InvalidToken, detail)
        }
        (_, "QUOTA_EXCEEDED") | (_, "UNAVAILABLE") | (_, "INTERNAL") => {
            TransportError::transient(detail)
        }
        (_, "THIRD_PARTY_AUTH_ERROR") | (401, _) | (403, _) => {
            TransportError::permanent(PermanentReason::Rejected, detail)
        }
        (400, _) => {
            if error.message.to_ascii_lowercase().contains("token") {
                TransportError::permanent(PermanentReason::InvalidToken, detail)
            } else {
                TransportError::permanent(PermanentReason::MalformedPayload, detail)
            }
        }
        (429, _) | (500..=599, _) => TransportError::transient(detail),
        _ => TransportError::permanent(PermanentReason::Rejected, detail),
    }
}
