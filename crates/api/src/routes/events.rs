//! Push-style event intake.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use courier_common::error::AppError;
use courier_common::types::{DeliveryOutcome, NotificationId, RawEvent};
use courier_ingestor::normalize::IngestError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/events", post(submit_event))
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: NotificationId,
    pub outcome: DeliveryOutcome,
}

/// POST /api/events — Normalize a raw event and dispatch it.
///
/// Responds once the dispatch has settled. Resubmitting an event that already
/// settled returns the stored outcome without sending again.
async fn submit_event(
    State(state): State<AppState>,
    Json(raw): Json<RawEvent>,
) -> Result<Json<SubmitResponse>, AppError> {
    let request = state.ingestor.ingest(&raw).map_err(|e| match e {
        IngestError::MalformedEvent { reason } => AppError::MalformedEvent(reason),
    })?;

    let id = request.id.clone();
    let outcome = state.engine.submit(request).await;
    Ok(Json(SubmitResponse { id, outcome }))
}
