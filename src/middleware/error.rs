use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};

use crate::error::Error;

/// Errors surfaced by the explorer routes.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Login flow failure; sends the browser home with the message.
    #[error("{0}")]
    Flow(Error),

    /// API call failure; rendered inline as JSON.
    #[error("{0}")]
    Api(Error),

    #[error("{0}")]
    BadRequest(String),

    /// Request refused before reaching the API (cross-site or foreign host).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Request body must be application/json")]
    UnsupportedMediaType,
}

impl RouteError {
    fn api_status(error: &Error) -> StatusCode {
        match error {
            e if e.requires_login() => StatusCode::UNAUTHORIZED,
            Error::HttpError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::InvalidEndpoint(_) | Error::InvalidJson(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match self {
            Self::Flow(ref e) => {
                tracing::warn!(error = %e, "Login flow failed");
                Redirect::to(&home_with_error(&e.to_string())).into_response()
            }
            Self::Api(ref e) => {
                let status = Self::api_status(e);
                if status.is_server_error() {
                    tracing::error!(error = %e, "API proxy error");
                }
                let body = serde_json::json!({
                    "error": e.to_string(),
                    "status": e.status(),
                });
                (status, Json(body)).into_response()
            }
            Self::BadRequest(ref msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": msg })),
            )
                .into_response(),
            Self::Forbidden(_) => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": self.to_string() })),
            )
                .into_response(),
            Self::UnsupportedMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Json(serde_json::json!({ "error": self.to_string() })),
            )
                .into_response(),
        }
    }
}

pub(super) fn home_with_error(message: &str) -> String {
    format!("/?error={}", urlencoding::encode(message))
}
