//! Delivery transports for push notifications.
//!
//! The dispatch engine only depends on [`DeliveryTransport`]. The concrete
//! provider protocol lives behind it:
//! - [`FcmTransport`] talks to the FCM HTTP v1 API
//! - [`LogTransport`] records sends in the log (dry-run / local development)

pub mod fcm;
pub mod log;
pub mod transport;

pub use fcm::FcmTransport;
pub use log::LogTransport;
pub use transport::{DeliveryReceipt, DeliveryTransport, PermanentReason, TransportError};
