//! Authenticated, retried requests from a node to the server.

use async_trait::async_trait;
use indispenso_core::cmd::{CmdPayload, LogBatch};
use indispenso_core::config::RetryPolicy;
use indispenso_core::signing;
use indispenso_core::types::CmdState;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Method, Url};
use std::time::Duration;
use uuid::Uuid;

use crate::{AgentError, Result};

const RAND_LEN: usize = 32;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// ServerLink
// ---------------------------------------------------------------------------

/// What a running command reports back to the server.
#[async_trait]
pub trait ServerLink: Send + Sync {
    async fn notify_state(&self, cmd_id: Uuid, state: CmdState) -> Result<()>;
    async fn flush_logs(&self, cmd_id: Uuid, batch: &LogBatch) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct Transport {
    base: Url,
    client_id: String,
    secure_token: String,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl Transport {
    pub fn new(
        endpoint: &str,
        client_id: impl Into<String>,
        secure_token: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut base = Url::parse(endpoint)
            .map_err(|e| AgentError::Response(format!("invalid endpoint {endpoint}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(AgentError::Response(format!(
                "endpoint {endpoint} cannot carry a path"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base,
            client_id: client_id.into(),
            secure_token: secure_token.into(),
            retry,
            http,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Full URL for `client/{id}/<rest...>` plus the path and query the
    /// `X-Auth` header is computed over.
    fn url(&self, rest: &[&str], query: &[(&str, &str)]) -> Result<(Url, String)> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AgentError::Response("endpoint cannot carry a path".into()))?;
            segments.pop_if_empty();
            segments.push("client");
            segments.push(&self.client_id);
            segments.extend(rest);
        }
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
            pairs.append_pair("_rand", &random_suffix());
        }
        let signed = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        Ok((url, signed))
    }

    async fn send_once(
        &self,
        method: Method,
        rest: &[&str],
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let (url, signed) = self.url(rest, query)?;
        tracing::debug!(%method, url = %url, "server request");

        let mut request = self.http.request(method, url);
        if !self.secure_token.is_empty() {
            if let Some(auth) = signing::request_signature(&self.secure_token, &signed) {
                request = request.header("X-Auth", auth);
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(AgentError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| AgentError::Response(format!("invalid JSON: {e}")))?;
        if json.get("status").and_then(|s| s.as_str()) != Some("OK") {
            return Err(AgentError::Response(text));
        }
        Ok(json)
    }

    /// Send with retries; 4xx answers are returned immediately.
    async fn request(
        &self,
        method: Method,
        rest: &[&str],
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), rest, query, body).await {
                Ok(json) => return Ok(json),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        path = %rest.join("/"),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "request failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Register with the server. Returns its instance id.
    pub async fn ping(&self, hostname: &str, tags: &[String]) -> Result<String> {
        let tags = tags.join(",");
        let json = self
            .request(
                Method::GET,
                &["ping"],
                &[("hostname", hostname), ("tags", tags.as_str())],
                None,
            )
            .await?;
        Ok(json
            .get("server_instance_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// Obtain a per-client auth token, checking its signature against the
    /// secure token when one is configured.
    pub async fn auth(&self) -> Result<String> {
        let json = self.request(Method::POST, &["auth"], &[], None).await?;
        let token = json
            .get("token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AgentError::Response("auth answer carries no token".into()))?;
        if !self.secure_token.is_empty() {
            let presented = json
                .get("token_signature")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let expected = signing::token_signature(&self.secure_token, token).unwrap_or_default();
            if presented.is_empty() || presented != expected {
                return Err(AgentError::InvalidTokenSignature);
            }
        }
        Ok(token.to_string())
    }

    /// Fetch commands queued for this node (long poll on the server side).
    pub async fn poll(&self) -> Result<Vec<CmdPayload>> {
        let json = self.request(Method::GET, &["cmds"], &[], None).await?;
        let cmds = json
            .get("cmds")
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        if cmds.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(cmds)
            .map_err(|e| AgentError::Response(format!("invalid cmds: {e}")))
    }
}

#[async_trait]
impl ServerLink for Transport {
    async fn notify_state(&self, cmd_id: Uuid, state: CmdState) -> Result<()> {
        let id = cmd_id.to_string();
        self.request(
            Method::PUT,
            &["cmd", id.as_str(), "state"],
            &[("state", state.as_str())],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn flush_logs(&self, cmd_id: Uuid, batch: &LogBatch) -> Result<()> {
        let id = cmd_id.to_string();
        let body = serde_json::to_value(batch)
            .map_err(|e| AgentError::Response(format!("unserializable log batch: {e}")))?;
        self.request(Method::PUT, &["cmd", id.as_str(), "logs"], &[], Some(&body))
            .await
            .map(|_| ())
    }
}

/// Cache-busting query value.
fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RAND_LEN)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
