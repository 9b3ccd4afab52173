//! HTTP ingress for the courier dispatch engine.
//!
//! - `GET  /health`
//! - `POST /api/events` — push one raw change-feed event for dispatch
//! - `GET  /api/notifications/{*id}` — stored delivery record
//! - `PUT  /api/users/{user_id}/device-token` — register a device token

pub mod routes;
pub mod state;
