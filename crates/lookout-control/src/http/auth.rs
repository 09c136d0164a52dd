// ABOUTME: Bearer-token extractor resolving the calling user through the token registry.
// ABOUTME: Browsers opening a WebSocket may pass the token as a `token` query parameter instead.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Deserialize;

use super::ApiError;
use crate::registry::UserId;
use crate::state::ControlState;

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl FromRequestParts<Arc<ControlState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ControlState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(q)| q.token)
            })
            .ok_or(ApiError::Unauthorized)?;

        let api_token = state
            .tokens
            .get(&token)
            .await
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthUser(api_token.user_id))
    }
}
