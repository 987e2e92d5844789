//! Server-side record of registered nodes and the commands dispatched to them.

use chrono::{DateTime, Utc};
use indispenso_core::cmd::{Cmd, CmdPayload};
use indispenso_core::error::{IndispensoError, Result};
use indispenso_core::signing;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RegisteredClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredClient {
    pub id: String,
    pub hostname: String,
    pub tags: Vec<String>,
    /// Per-client HMAC key; `None` until the node has called `auth`.
    #[serde(skip)]
    pub auth_token: Option<String>,
    pub last_ping: DateTime<Utc>,
    /// Dispatched commands keyed by id.
    #[serde(skip)]
    pub cmds: HashMap<Uuid, Cmd>,
    /// Commands not yet delivered to the node, oldest first.
    #[serde(skip)]
    pub queue: VecDeque<Uuid>,
}

impl RegisteredClient {
    fn new(id: &str, hostname: &str, tags: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            hostname: hostname.to_string(),
            tags,
            auth_token: None,
            last_ping: Utc::now(),
            cmds: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn drain_queue(&mut self) -> Vec<CmdPayload> {
        let ids: Vec<Uuid> = self.queue.drain(..).collect();
        ids.iter()
            .filter_map(|id| self.cmds.get(id))
            .map(Cmd::to_payload)
            .collect()
    }
}

struct ClientSlot {
    client: Mutex<RegisteredClient>,
    work: Notify,
}

// ---------------------------------------------------------------------------
// ClientRegistry
// ---------------------------------------------------------------------------

/// Registered nodes keyed by client id.
///
/// The map sits behind a registry-wide `RwLock`; each client has its own
/// mutex so updates to one node never serialize against another.
pub struct ClientRegistry {
    secure_token: String,
    clients: RwLock<HashMap<String, Arc<ClientSlot>>>,
}

impl ClientRegistry {
    pub fn new(secure_token: impl Into<String>) -> Self {
        Self {
            secure_token: secure_token.into(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, id: &str) -> Result<Arc<ClientSlot>> {
        self.clients
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| IndispensoError::ClientNotFound(id.to_string()))
    }

    /// Register a node or refresh its hostname, tags and last-seen time.
    pub async fn ping(&self, id: &str, hostname: &str, tags: Vec<String>) {
        if let Ok(slot) = self.slot(id).await {
            let mut client = slot.client.lock().await;
            client.hostname = hostname.to_string();
            client.tags = tags;
            client.last_ping = Utc::now();
            return;
        }
        let mut clients = self.clients.write().await;
        let slot = clients.entry(id.to_string()).or_insert_with(|| {
            tracing::info!(client_id = %id, hostname = %hostname, "registered client");
            Arc::new(ClientSlot {
                client: Mutex::new(RegisteredClient::new(id, hostname, tags.clone())),
                work: Notify::new(),
            })
        });
        let mut client = slot.client.lock().await;
        client.hostname = hostname.to_string();
        client.tags = tags;
        client.last_ping = Utc::now();
    }

    /// Issue a fresh auth token for `id`.
    ///
    /// Returns `(token, token_signature)`; the signature lets the node check
    /// the token came from a server holding the pre-shared secure token.
    pub async fn issue_token(&self, id: &str) -> Result<(String, String)> {
        let slot = self.slot(id).await?;
        let token = signing::generate_token();
        let token_signature =
            signing::token_signature(&self.secure_token, &token).unwrap_or_default();
        slot.client.lock().await.auth_token = Some(token.clone());
        tracing::info!(client_id = %id, "issued auth token");
        Ok((token, token_signature))
    }

    pub async fn auth_token(&self, id: &str) -> Option<String> {
        let slot = self.slot(id).await.ok()?;
        let client = slot.client.lock().await;
        client.auth_token.clone()
    }

    pub async fn get(&self, id: &str) -> Option<RegisteredClient> {
        let slot = self.slot(id).await.ok()?;
        let client = slot.client.lock().await;
        Some(client.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.clients.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<RegisteredClient> {
        let slots: Vec<Arc<ClientSlot>> = self.clients.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.client.lock().await.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Record `cmd` as dispatched to its client and queue it for delivery.
    pub async fn submit(&self, cmd: Cmd) -> Result<()> {
        let slot = self.slot(&cmd.client_id).await?;
        {
            let mut client = slot.client.lock().await;
            tracing::debug!(
                cmd_id = %cmd.id,
                client_id = %cmd.client_id,
                iteration = cmd.execution_iteration_id,
                "dispatching command"
            );
            client.queue.push_back(cmd.id);
            client.cmds.insert(cmd.id, cmd);
        }
        slot.work.notify_one();
        Ok(())
    }

    /// Hand out every queued command for `id`, waiting up to `wait` when
    /// nothing is queued yet.
    pub async fn poll(&self, id: &str, wait: Duration) -> Result<Vec<CmdPayload>> {
        let slot = self.slot(id).await?;
        let ready = slot.client.lock().await.drain_queue();
        if !ready.is_empty() || wait.is_zero() {
            return Ok(ready);
        }
        let _ = tokio::time::timeout(wait, slot.work.notified()).await;
        let ready = slot.client.lock().await.drain_queue();
        Ok(ready)
    }

    /// Snapshot of every dispatched command of a request at one iteration.
    pub async fn cmds_for(&self, request_id: Uuid, iteration: u32) -> Vec<Cmd> {
        self.scan(|cmd| {
            cmd.consensus_request_id == Some(request_id)
                && cmd.execution_iteration_id == iteration
        })
        .await
    }

    /// Snapshot of every dispatched command of a request.
    pub async fn cmds_for_request(&self, request_id: Uuid) -> Vec<Cmd> {
        self.scan(|cmd| cmd.consensus_request_id == Some(request_id))
            .await
    }

    async fn scan(&self, keep: impl Fn(&Cmd) -> bool) -> Vec<Cmd> {
        let slots: Vec<Arc<ClientSlot>> = self.clients.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let client = slot.client.lock().await;
            out.extend(client.cmds.values().filter(|c| keep(c)).cloned());
        }
        out
    }

    /// Apply `f` to one dispatched command under its client's lock.
    pub async fn update_cmd<R>(
        &self,
        client_id: &str,
        cmd_id: Uuid,
        f: impl FnOnce(&mut Cmd) -> R,
    ) -> Result<R> {
        let slot = self.slot(client_id).await?;
        let mut client = slot.client.lock().await;
        let cmd = client
            .cmds
            .get_mut(&cmd_id)
            .ok_or_else(|| IndispensoError::CmdNotFound(cmd_id.to_string()))?;
        Ok(f(cmd))
    }

    /// Drop every command of a request, delivered or not. Returns how many.
    pub async fn remove_request_cmds(&self, request_id: Uuid) -> usize {
        let slots: Vec<Arc<ClientSlot>> = self.clients.read().await.values().cloned().collect();
        let mut removed = 0;
        for slot in slots {
            let mut client = slot.client.lock().await;
            let before = client.cmds.len();
            client
                .cmds
                .retain(|_, cmd| cmd.consensus_request_id != Some(request_id));
            removed += before - client.cmds.len();
            let RegisteredClient { cmds, queue, .. } = &mut *client;
            queue.retain(|id| cmds.contains_key(id));
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
