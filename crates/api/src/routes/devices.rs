//! Device token registration.

use axum::extract::{Path, State};
use axum::routing::put;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_common::error::AppError;
use courier_common::types::UserId;
use courier_engine::DirectoryError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/users/{user_id}/device-token", put(register_device_token))
}

#[derive(Debug, Deserialize)]
pub struct RegisterTokenRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterTokenResponse {
    pub user_id: UserId,
    pub registered_at: DateTime<Utc>,
}

/// PUT /api/users/:user_id/device-token — Register or replace a user's device token.
async fn register_device_token(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<RegisterTokenRequest>,
) -> Result<Json<RegisterTokenResponse>, AppError> {
    let token = body.token.trim();
    if token.is_empty() {
        return Err(AppError::Validation("token must not be empty".to_string()));
    }

    let user_id = UserId::new(user_id);
    let address = state
        .engine
        .directory()
        .register(&user_id, token)
        .await
        .map_err(|e| match e {
            DirectoryError::EmptyUserId => AppError::Validation(e.to_string()),
            DirectoryError::Database(e) => AppError::Database(e),
            DirectoryError::Store(msg) => AppError::Internal(msg),
        })?;

    tracing::info!(user_id = %user_id, "Registered device token");

    Ok(Json(RegisterTokenResponse {
        user_id: address.user_id,
        registered_at: address.last_refreshed_at,
    }))
}
