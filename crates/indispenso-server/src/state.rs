use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::AuthConfig;
use crate::engine::Engine;

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: AuthConfig,
    /// Random per process; lets nodes notice a server restart.
    pub server_instance_id: Uuid,
    pub poll_timeout: Duration,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let state = Self {
            auth: AuthConfig::with_token(engine.config.token.clone()),
            poll_timeout: Duration::from_secs(engine.config.server.poll_timeout_seconds),
            server_instance_id: Uuid::new_v4(),
            engine,
        };

        if state.auth.secure_token.is_none() {
            tracing::warn!("no secure token configured, node requests are not authenticated");
        }

        // Drop stale consensus requests periodically.
        // Guard: only spawn if inside a Tokio runtime (skipped in sync unit tests).
        if tokio::runtime::Handle::try_current().is_ok() {
            let engine = state.engine.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
                loop {
                    ticker.tick().await;
                    let pruned = engine.prune().await;
                    if pruned > 0 {
                        tracing::info!(pruned, "pruned consensus requests");
                    }
                }
            });
        }

        state
    }

    /// Override the long-poll window (tests use a short one).
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}
