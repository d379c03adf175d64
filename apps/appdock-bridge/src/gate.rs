//! Access gate in front of every protected route.
//!
//! Ordinary requests must carry `Authorization: Bearer <token>`. Upgrade
//! requests may instead pass `?token=<token>`, since browsers cannot attach
//! headers to a WebSocket handshake; the query parameter wins when both are
//! present. The resolved [`Principal`] is stored in the request extensions.

use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use metrics::counter;
use serde::Deserialize;
use tracing::debug;

use crate::{
    routes::ApiError,
    state::AppState,
    token::{Claims, TokenAuthority, TokenError},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    Authenticated(Claims),
    /// Authentication is switched off; nothing was checked.
    Anonymous,
}

impl Principal {
    pub fn subject(&self) -> Option<&str> {
        match self {
            Principal::Authenticated(claims) => Some(&claims.sub),
            Principal::Anonymous => None,
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn query_token(parts: &Parts) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
}

/// Resolves a candidate token into a principal.
pub fn authorize(tokens: &TokenAuthority, candidate: Option<&str>) -> Result<Principal, ApiError> {
    if !tokens.is_enabled() {
        return Ok(Principal::Anonymous);
    }
    let Some(token) = candidate else {
        counter!("appdock_token_rejections_total", 1, "reason" => "missing");
        return Err(ApiError::Unauthorized);
    };
    match tokens.validate(token) {
        Ok(claims) => Ok(Principal::Authenticated(claims)),
        Err(TokenError::InvalidToken(reason)) => {
            counter!("appdock_token_rejections_total", 1, "reason" => reason.metric_label());
            debug!(%reason, "token rejected");
            Err(ApiError::Unauthorized)
        }
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

/// Gate for ordinary API routes (header only).
#[derive(Clone, Debug)]
pub struct RequireToken(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for RequireToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let principal = authorize(&state.tokens, bearer_token(&parts.headers))?;
        parts.extensions.insert(principal.clone());
        Ok(RequireToken(principal))
    }
}

/// Gate for connection upgrades (query parameter, then header).
#[derive(Clone, Debug)]
pub struct RequireUpgradeToken(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for RequireUpgradeToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let from_query = query_token(parts);
        let candidate = from_query.as_deref().or_else(|| bearer_token(&parts.headers));
        let principal = authorize(&state.tokens, candidate)?;
        parts.extensions.insert(principal.clone());
        Ok(RequireUpgradeToken(principal))
    }
}
