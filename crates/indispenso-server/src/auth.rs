use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use indispenso_core::signing;

pub const AUTH_HEADER: &str = "X-Auth";

/// Controls node request authentication.
///
/// When `secure_token` is `None` the middleware is a transparent no-op and
/// every request passes through.
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub secure_token: Option<String>,
}

impl AuthConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            secure_token: (!token.is_empty()).then_some(token),
        }
    }
}

/// Axum middleware checking the `X-Auth` header of node requests.
///
/// The header must be the HMAC of the request path plus query under the
/// pre-shared secure token. Anything else gets a JSON 401.
pub async fn auth_middleware(
    State(config): State<AuthConfig>,
    req: Request,
    next: Next,
) -> Response {
    let Some(ref token) = config.secure_token else {
        return next.run(req).await;
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri().path());
    let presented = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !presented.is_empty() && signing::verify_request(token, path_and_query, presented) {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "rejected request with invalid X-Auth");
    let mut resp = Response::new(Body::from(
        r#"{"status":"ERROR","error":"unauthorized"}"#,
    ));
    *resp.status_mut() = axum::http::StatusCode::UNAUTHORIZED;
    resp.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    resp
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
