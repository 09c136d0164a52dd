// ABOUTME: HTTP API router for the dashboard: sessions, force update, cron, tokens, deletes.
// ABOUTME: Every JSON reply uses the {code, message, result} envelope.

pub mod api;
pub mod auth;
pub mod session;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::ControlError;
use crate::state::ControlState;

pub use auth::AuthUser;

/// Build the HTTP router. gRPC traffic never reaches it; see [`crate::mux`].
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/v1/agents", get(api::list_agents))
        .route("/api/v1/file", get(session::create_file_session))
        .route("/api/v1/ws/file/:id", get(session::file_stream))
        .route("/api/v1/force-update", post(api::force_update))
        .route("/api/v1/cron", post(api::upsert_cron))
        .route("/api/v1/cron/:id/manual", get(api::manual_cron))
        .route("/api/v1/token", get(api::list_tokens).post(api::issue_token))
        .route("/api/v1/token/:token", delete(api::revoke_token))
        .route("/api/v1/entities/:kind/:id", delete(api::delete_entity))
        .with_state(state)
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(result: T) -> Json<Self> {
        Json(Self {
            code: StatusCode::OK.as_u16(),
            message: "success".to_string(),
            result: Some(result),
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Control(ControlError),
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError::Control(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Control(err) => match err {
                ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
                ControlError::AlreadyExists { .. } | ControlError::InvalidState(_) => {
                    StatusCode::CONFLICT
                }
                ControlError::Unreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                ControlError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
                ControlError::Invalid(_) => StatusCode::BAD_REQUEST,
                ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized => "missing or invalid API token".to_string(),
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Control(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiResponse::<()> {
            code: status.as_u16(),
            message: self.message(),
            result: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use axum::http::Method;

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let app = router(state().await);
        let (status, body) = call_as(&app, None, Method::GET, "/api/v1/agents", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 401);
        assert!(body.get("result").is_none());
    }

    #[tokio::test]
    async fn test_unknown_token_is_unauthorized() {
        let app = router(state().await);
        let (status, _) =
            call_as(&app, Some("forged"), Method::GET, "/api/v1/agents", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_healthz_needs_no_token() {
        let app = router(state().await);
        let (status, _) = call_as(&app, None, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_control_errors_map_to_http_status() {
        let cases = [
            (ControlError::not_found("job", "1"), StatusCode::NOT_FOUND),
            (
                ControlError::InvalidState("twice".into()),
                StatusCode::CONFLICT,
            ),
            (
                ControlError::unreachable("a1", "offline"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ControlError::ResourceExhausted("cap".into()),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (ControlError::Invalid("cron".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
