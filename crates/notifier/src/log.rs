use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::transport::{DeliveryReceipt, DeliveryTransport, TransportError};

/// Dry-run transport: logs the message and reports it as accepted.
///
/// Used when no FCM credentials are configured.
#[derive(Debug, Default)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeliveryTransport for LogTransport {
    async fn send(
        &self,
        token: &str,
        title: &str,
        body: &str,
        payload: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt, TransportError> {
        let message_id = format!("log/{}", Uuid::new_v4());

        tracing::info!(
            transport = "log",
            token = %redact(token),
            message_id = %message_id,
            title = %title,
            body = %body,
            data_fields = payload.len(),
            "Push notification (dry run)"
        );

        Ok(DeliveryReceipt { message_id })
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Keep only a short prefix of a device token for logging.
pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}…", prefix)
}
