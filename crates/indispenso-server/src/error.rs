use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use indispenso_core::error::IndispensoError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 400 Bad Request errors
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 400 through the `anyhow::Error` chain for
/// malformed input that never reaches the domain layer.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }
}

fn status_for(e: &IndispensoError) -> StatusCode {
    match e {
        IndispensoError::TemplateNotFound(_)
        | IndispensoError::ClientNotFound(_)
        | IndispensoError::CmdNotFound(_)
        | IndispensoError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        IndispensoError::InvalidTransition { .. }
        | IndispensoError::TemplateDisabled(_)
        | IndispensoError::SelfApproval(_) => StatusCode::CONFLICT,
        IndispensoError::InvalidState(_)
        | IndispensoError::InvalidOutputStream(_)
        | IndispensoError::InvalidRule(_)
        | IndispensoError::InvalidStrategy(_) => StatusCode::BAD_REQUEST,
        IndispensoError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
        IndispensoError::InvalidConfig(_)
        | IndispensoError::Io(_)
        | IndispensoError::Yaml(_)
        | IndispensoError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<BadRequestError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<IndispensoError>() {
            status_for(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!("request failed: {:#}", self.0);
        } else {
            tracing::debug!(%status, "request rejected: {}", self.0);
        }

        let body = serde_json::json!({ "status": "ERROR", "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
