pub mod auth;
pub mod consensus;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod registry;
pub mod routes;
pub mod state;

use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use engine::Engine;
pub use state::AppState;

/// Build the axum Router for the node protocol.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/client/{id}/ping", get(routes::clients::ping))
        .route("/client/{id}/auth", post(routes::clients::auth))
        .route("/client/{id}/cmds", get(routes::clients::cmds))
        .route(
            "/client/{id}/cmd/{cmd}/state",
            put(routes::clients::put_state),
        )
        .route(
            "/client/{id}/cmd/{cmd}/logs",
            put(routes::clients::put_logs),
        )
        .layer(middleware::from_fn_with_state(
            app_state.auth.clone(),
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Start the indispenso server.
pub async fn serve(engine: Arc<Engine>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(engine, listener).await
}

/// Start the server on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when `port = 0` and
/// the OS picks a free port).
pub async fn serve_on(engine: Arc<Engine>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(AppState::new(engine));

    tracing::info!("indispenso server listening on port {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
