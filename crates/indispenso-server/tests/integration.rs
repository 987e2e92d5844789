use axum::http::StatusCode;
use http_body_util::BodyExt;
use indispenso_core::cmd::CmdPayload;
use indispenso_core::config::Config;
use indispenso_core::signing;
use indispenso_core::strategy::ExecutionStrategy;
use indispenso_core::template::{JsonTemplateStore, Template, ValidationRule};
use indispenso_core::types::{CmdState, OutputStream};
use indispenso_server::{build_router, AppState, Engine};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const SECURE: &str = "integration-secure-token";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Engine backed by a templates file inside `dir`, plus its router.
fn setup(dir: &TempDir, template: Template) -> (Arc<Engine>, axum::Router) {
    let path = dir.path().join("templates.json");
    let store = JsonTemplateStore::load(&path).unwrap();
    store.add(template);
    store.save().unwrap();
    let store = JsonTemplateStore::load(&path).unwrap();

    let mut config = Config::default();
    config.token = SECURE.into();
    let engine = Arc::new(Engine::new(config, Arc::new(store)));
    let state = AppState::new(engine.clone()).with_poll_timeout(Duration::from_millis(50));
    (engine, build_router(state))
}

/// Send a request signed with `X-Auth` and return (status, parsed JSON body).
async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Auth", signing::request_signature(SECURE, uri).unwrap());
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            axum::body::Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => axum::body::Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Ping and authenticate a node, returning its auth token.
async fn register(app: &axum::Router, id: &str) -> String {
    let (status, body) = send(app, "GET", &format!("/client/{id}/ping?hostname={id}.local&_rand=1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");
    let (status, body) = send(app, "POST", &format!("/client/{id}/auth?_rand=2"), None).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    let sig = body["token_signature"].as_str().unwrap();
    assert_eq!(signing::token_signature(SECURE, &token).unwrap(), sig);
    token
}

async fn poll(app: &axum::Router, id: &str) -> Vec<CmdPayload> {
    let (status, body) = send(app, "GET", &format!("/client/{id}/cmds?_rand=3"), None).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_value(body["cmds"].clone()).unwrap()
}

async fn report(app: &axum::Router, id: &str, cmd: &CmdPayload, state: CmdState) -> serde_json::Value {
    let uri = format!("/client/{id}/cmd/{}/state?state={state}", cmd.id);
    let (status, body) = send(app, "PUT", &uri, None).await;
    assert_eq!(status, StatusCode::OK, "{state}: {body}");
    body
}

/// Drive one delivered command through a successful run with `stdout`.
async fn run(app: &axum::Router, id: &str, cmd: &CmdPayload, stdout: &[&str]) -> serde_json::Value {
    for state in [
        CmdState::Validating,
        CmdState::Starting,
        CmdState::StartedExecution,
        CmdState::FinishedExecution,
    ] {
        report(app, id, cmd, state).await;
    }
    let (status, _) = send(
        app,
        "PUT",
        &format!("/client/{id}/cmd/{}/logs", cmd.id),
        Some(serde_json::json!({ "output": stdout, "error": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    report(app, id, cmd, CmdState::FlushedLogs).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsigned_request_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_, app) = setup(&dir, Template::new("t", "true", 5));
    let req = axum::http::Request::builder()
        .uri("/client/n1/ping")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ping_reports_server_instance() {
    let dir = TempDir::new().unwrap();
    let (engine, app) = setup(&dir, Template::new("t", "true", 5));
    let (_, first) = send(&app, "GET", "/client/n1/ping?tags=web,eu", None).await;
    let (_, second) = send(&app, "GET", "/client/n1/ping?tags=web", None).await;
    assert_eq!(first["server_instance_id"], second["server_instance_id"]);
    let client = engine.clients.get("n1").await.unwrap();
    assert_eq!(client.tags, vec!["web".to_string()]);
}

#[tokio::test]
async fn unknown_client_cannot_poll_or_auth() {
    let dir = TempDir::new().unwrap();
    let (_, app) = setup(&dir, Template::new("t", "true", 5));
    let (status, _) = send(&app, "GET", "/client/ghost/cmds", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "POST", "/client/ghost/auth", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delivered_command_is_signed_for_its_node() {
    let dir = TempDir::new().unwrap();
    let template = Template::new("uptime", "uptime", 5);
    let tid = template.id.clone();
    let (engine, app) = setup(&dir, template);
    let token = register(&app, "n1").await;

    let req = engine.request(&tid, vec!["n1".into()], "alice", "").await.unwrap();
    engine.approve(req.id, "bob").await.unwrap();

    let cmds = poll(&app, "n1").await;
    assert_eq!(cmds.len(), 1);
    let cmd = cmds[0].clone().into_cmd("n1");
    assert!(cmd.verify(&token));
    assert!(poll(&app, "n1").await.is_empty());
}

#[tokio::test]
async fn illegal_state_report_is_409_and_bad_state_is_400() {
    let dir = TempDir::new().unwrap();
    let template = Template::new("t", "true", 5);
    let tid = template.id.clone();
    let (engine, app) = setup(&dir, template);
    register(&app, "n1").await;
    let req = engine.request(&tid, vec!["n1".into()], "alice", "").await.unwrap();
    engine.approve(req.id, "bob").await.unwrap();
    let cmd = poll(&app, "n1").await.remove(0);

    let (status, _) = send(&app, "PUT", &format!("/client/n1/cmd/{}/state?state=finished", cmd.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(&app, "PUT", &format!("/client/n1/cmd/{}/state?state=exploded", cmd.id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, "PUT", &format!("/client/n1/cmd/{}/state", cmd.id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn validation_runs_after_log_flush() {
    let dir = TempDir::new().unwrap();
    let template = Template::new("health", "curl -s localhost/health", 5)
        .with_rule(ValidationRule::new(OutputStream::Stdout, "OK", true).unwrap());
    let tid = template.id.clone();
    let (engine, app) = setup(&dir, template);
    register(&app, "n1").await;
    register(&app, "n2").await;
    let req = engine
        .request(&tid, vec!["n1".into(), "n2".into()], "alice", "")
        .await
        .unwrap();
    engine.approve(req.id, "bob").await.unwrap();

    let ok = poll(&app, "n1").await.remove(0);
    let bad = poll(&app, "n2").await.remove(0);
    assert_eq!(run(&app, "n1", &ok, &["status: OK"]).await["state"], "finished");
    assert_eq!(run(&app, "n2", &bad, &["status: DOWN"]).await["state"], "failed_validation");
}

#[tokio::test]
async fn canary_rollout_over_http() {
    let dir = TempDir::new().unwrap();
    let template = Template::new("deploy", "deploy.sh", 5).with_strategy(ExecutionStrategy::Canary);
    let tid = template.id.clone();
    let (engine, app) = setup(&dir, template);
    let nodes = ["n1", "n2", "n3"];
    for node in nodes {
        register(&app, node).await;
    }
    let req = engine
        .request(&tid, nodes.iter().map(|n| n.to_string()).collect(), "alice", "release")
        .await
        .unwrap();
    let done = engine.consensus.completion(req.id).await.unwrap();
    engine.approve(req.id, "bob").await.unwrap();

    let mut delivered = Vec::new();
    for node in nodes {
        for cmd in poll(&app, node).await {
            delivered.push((node, cmd));
        }
    }
    assert_eq!(delivered.len(), 1, "only the canary goes out first");
    let (canary_node, canary) = delivered.remove(0);
    report(&app, canary_node, &canary, CmdState::Validating).await;
    for node in nodes {
        assert!(poll(&app, node).await.is_empty());
    }

    run(&app, canary_node, &canary, &[]).await;
    let mut rest = Vec::new();
    for node in nodes {
        for cmd in poll(&app, node).await {
            rest.push((node, cmd));
        }
    }
    assert_eq!(rest.len(), 2);
    for (node, cmd) in &rest {
        run(&app, node, cmd, &[]).await;
    }

    tokio::time::timeout(Duration::from_secs(1), done)
        .await
        .unwrap()
        .unwrap();
    let iterations: Vec<u32> = engine
        .clients
        .cmds_for_request(req.id)
        .await
        .iter()
        .map(|c| c.execution_iteration_id)
        .collect();
    assert_eq!(iterations.iter().filter(|i| **i == 1).count(), 2);
}
