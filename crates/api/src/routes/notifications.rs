//! Delivery record lookup.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use courier_common::error::AppError;
use courier_common::types::{DeliveryRecord, NotificationId};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    // Ids contain '/', hence the wildcard.
    Router::new().route("/api/notifications/{*id}", get(get_notification))
}

/// GET /api/notifications/*id — Stored delivery record for a notification id.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryRecord>, AppError> {
    let id = NotificationId::new(id.trim_matches('/'));
    state
        .engine
        .outcome(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No delivery record for {}", id)))
}
