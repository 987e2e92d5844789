//! Long-running node loops: registration, auth refresh and command polling.

use indispenso_core::cmd::CmdPayload;
use indispenso_core::config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::executor::Executor;
use crate::transport::Transport;
use crate::{AgentError, Result};

/// Back-off after a failed poll so a dead server is not hammered.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Node {
    client_id: String,
    hostname: String,
    tags: Vec<String>,
    tmp_dir: PathBuf,
    ping_interval: Duration,
    /// Without a secure token nothing can be verified and commands run unchecked.
    secure: bool,
    transport: Arc<Transport>,
    auth_token: Arc<RwLock<Option<String>>>,
    server_instance_id: RwLock<Option<String>>,
}

impl Node {
    pub fn new(config: &Config, client_id: impl Into<String>) -> Result<Self> {
        let client_id = client_id.into();
        let endpoint = config.require_endpoint()?;
        let transport = Transport::new(
            endpoint,
            client_id.clone(),
            config.token.clone(),
            config.retry.clone(),
        )?;
        Ok(Self {
            client_id,
            hostname: config.hostname.clone(),
            tags: config.client.tags.clone(),
            tmp_dir: config.client.tmp_dir.clone(),
            ping_interval: Duration::from_secs(config.client.ping_interval_seconds.max(1)),
            secure: !config.token.is_empty(),
            transport: Arc::new(transport),
            auth_token: Arc::new(RwLock::new(None)),
            server_instance_id: RwLock::new(None),
        })
    }

    /// Register, authenticate, then ping and poll until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(client_id = %self.client_id, hostname = %self.hostname, tags = ?self.tags, "starting node");
        if !self.secure {
            tracing::warn!("no secure token configured, commands run without signature checks");
        }

        self.ping().await;
        self.authenticate().await;

        let pinger = {
            let node = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(node.ping_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stale = node.ping().await;
                    if stale || node.auth_token.read().await.is_none() {
                        node.authenticate().await;
                    }
                }
            })
        };

        loop {
            match self.transport.poll().await {
                Ok(cmds) => {
                    for payload in cmds {
                        self.spawn_execution(payload).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("poll failed: {e}");
                    // A 4xx means the server no longer knows this node or its
                    // token, typically after a restart.
                    if is_client_error(&e) {
                        self.ping().await;
                        self.authenticate().await;
                    }
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
            if pinger.is_finished() {
                tracing::error!("ping loop stopped");
                return;
            }
        }
    }

    /// Ping the server. Returns true when the token should be renewed: the
    /// server instance changed since the last ping, or the ping was refused.
    async fn ping(&self) -> bool {
        match self.transport.ping(&self.hostname, &self.tags).await {
            Ok(instance) => {
                let mut current = self.server_instance_id.write().await;
                if current.as_deref() == Some(instance.as_str()) {
                    return false;
                }
                let restarted = current.is_some();
                if restarted {
                    tracing::warn!(server_instance_id = %instance, "server restarted, re-registering");
                } else {
                    tracing::info!(server_instance_id = %instance, "registered with server");
                }
                *current = Some(instance);
                restarted
            }
            Err(e) => {
                tracing::warn!("ping failed: {e}");
                is_client_error(&e)
            }
        }
    }

    async fn authenticate(&self) {
        match self.transport.auth().await {
            Ok(token) => {
                *self.auth_token.write().await = Some(token);
                tracing::info!("authenticated with server");
            }
            Err(e) => tracing::error!("authentication failed: {e}"),
        }
    }

    /// Run one delivered command on its own task.
    async fn spawn_execution(&self, payload: CmdPayload) {
        let token = match (self.auth_token.read().await.clone(), self.secure) {
            (Some(token), _) => Some(token),
            // A secure node without a token cannot verify anything; an empty
            // key makes every signature check fail.
            (None, true) => Some(String::new()),
            (None, false) => None,
        };
        let link = self.transport.clone();
        let tmp_dir = self.tmp_dir.clone();
        let mut cmd = payload.into_cmd(self.client_id.clone());
        tokio::spawn(async move {
            let executor = Executor::new(&*link, &tmp_dir, token.as_deref());
            let end = executor.execute(&mut cmd).await;
            tracing::debug!(cmd_id = %cmd.id, state = %end, "command done");
        });
    }
}

fn is_client_error(e: &AgentError) -> bool {
    matches!(e, AgentError::Status { status, .. } if (400..500).contains(status))
}
