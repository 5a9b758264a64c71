//! `POST /api/v1/admin/tokens` — the sole administrative endpoint, gated
//! by a bearer token configured out-of-band (`ForgeConfig::admin_token`)
//! rather than by a worker/user identity the rest of the backbone knows.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use forge_core::model::RegistrationToken;

use crate::http::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": { "kind": "unauthorized", "message": "missing or invalid admin token" } })),
    )
        .into_response()
}

fn is_authorized(headers: &HeaderMap, configured: &Option<String>) -> bool {
    let Some(expected) = configured else { return false };
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else { return false };
    let Ok(value) = header.to_str() else { return false };
    value.strip_prefix("Bearer ").map(|token| token == expected).unwrap_or(false)
}

pub async fn create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTokenRequest>,
) -> Response {
    if !is_authorized(&headers, &state.config.admin_token) {
        return unauthorized();
    }

    let token = uuid::Uuid::new_v4().to_string();
    let record = RegistrationToken {
        token: token.clone(),
        display_name: req.display_name,
        created_at: Utc::now(),
        expires_at: req.expires_at,
        revoked: false,
        consumed_by: None,
    };

    match state.store.create_registration_token(record).await {
        Ok(()) => Json(CreateTokenResponse { token }).into_response(),
        Err(err) => AppError::from(err).into_response(),
    }
}
