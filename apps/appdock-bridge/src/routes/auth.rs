use axum::{extract::rejection::JsonRejection, extract::State, http::HeaderMap, Json};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::ApiError;
use crate::{
    gate::{bearer_token, RequireToken},
    state::AppState,
    token::TokenError,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    token: String,
    username: String,
    expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    token: String,
    expires_in: i64,
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "enabled": state.tokens.is_enabled() }))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".into(),
        ));
    }

    match state.tokens.issue(&request.username, &request.password) {
        Ok(issued) => {
            counter!("appdock_logins_total", 1, "outcome" => "success");
            info!(
                username = %issued.claims.sub,
                expires_at = ?issued.claims.expires_at(),
                "login succeeded"
            );
            Ok(Json(LoginResponse {
                expires_in: issued.expires_in(),
                username: issued.claims.sub,
                token: issued.token,
            }))
        }
        Err(TokenError::InvalidCredentials) => {
            counter!("appdock_logins_total", 1, "outcome" => "rejected");
            warn!(username = %request.username, "login rejected");
            Err(ApiError::Unauthorized)
        }
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

/// Re-issues the bearer token. Works even when the gate is disabled, since
/// there is still a concrete token to renew.
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    match state.tokens.refresh(token) {
        Ok(issued) => Ok(Json(RefreshResponse {
            expires_in: state.tokens.lifetime_secs(),
            token: issued.token,
        })),
        Err(TokenError::Signing(err)) => Err(ApiError::Internal(err.to_string())),
        Err(_) => Err(ApiError::Unauthorized),
    }
}

pub async fn me(RequireToken(principal): RequireToken) -> Result<Json<Value>, ApiError> {
    let username = principal.subject().ok_or(ApiError::Unauthorized)?;
    Ok(Json(json!({ "username": username })))
}
