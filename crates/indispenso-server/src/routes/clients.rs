use axum::extract::{Path, Query, State};
use axum::Json;
use indispenso_core::cmd::LogBatch;
use indispenso_core::types::CmdState;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(serde::Deserialize)]
pub struct PingParams {
    #[serde(default)]
    pub hostname: Option<String>,
    /// Comma separated.
    #[serde(default)]
    pub tags: Option<String>,
}

/// GET /client/{id}/ping: register or refresh a node.
pub async fn ping(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PingParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let hostname = params.hostname.unwrap_or_else(|| id.clone());
    let tags = params
        .tags
        .as_deref()
        .map(|t| {
            t.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    app.engine.clients.ping(&id, &hostname, tags).await;

    Ok(Json(serde_json::json!({
        "status": "OK",
        "server_instance_id": app.server_instance_id,
    })))
}

/// POST /client/{id}/auth: issue a fresh per-client auth token.
pub async fn auth(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (token, token_signature) = app.engine.clients.issue_token(&id).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "token": token,
        "token_signature": token_signature,
    })))
}

/// GET /client/{id}/cmds: long-poll for commands to execute.
pub async fn cmds(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let cmds = app.engine.clients.poll(&id, app.poll_timeout).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "cmds": cmds,
    })))
}

#[derive(serde::Deserialize)]
pub struct StateParams {
    pub state: Option<String>,
}

/// PUT /client/{id}/cmd/{cmd}/state?state=: report a command state change.
pub async fn put_state(
    State(app): State<AppState>,
    Path((id, cmd_id)): Path<(String, Uuid)>,
    Query(params): Query<StateParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Some(raw) = params.state else {
        return Err(AppError::bad_request("missing state parameter"));
    };
    let state: CmdState = raw.parse()?;
    let cmd = app.engine.record_state(&id, cmd_id, state).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "state": cmd.state,
    })))
}

/// PUT /client/{id}/cmd/{cmd}/logs: append a batch of output lines.
pub async fn put_logs(
    State(app): State<AppState>,
    Path((id, cmd_id)): Path<(String, Uuid)>,
    Json(batch): Json<LogBatch>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.engine.record_logs(&id, cmd_id, &batch).await?;
    Ok(Json(serde_json::json!({ "status": "OK" })))
}
