//! Sequencing of phased rollouts.

use async_trait::async_trait;
use indispenso_core::cmd::Cmd;
use indispenso_core::error::Result;
use indispenso_core::strategy::ExecutionStrategy;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::registry::ClientRegistry;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Where the coordinator reads dispatched commands from and submits new ones.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatched(&self, request_id: Uuid, iteration: u32) -> Vec<Cmd>;
    async fn submit(&self, cmd: Cmd) -> Result<()>;
}

#[async_trait]
impl Dispatcher for ClientRegistry {
    async fn dispatched(&self, request_id: Uuid, iteration: u32) -> Vec<Cmd> {
        self.cmds_for(request_id, iteration).await
    }

    async fn submit(&self, cmd: Cmd) -> Result<()> {
        ClientRegistry::submit(self, cmd).await
    }
}

// ---------------------------------------------------------------------------
// ExecutionCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOutcome {
    /// Nothing left to release.
    Drained,
    /// The current batch still has commands in flight.
    Blocked,
    /// A new batch went out; `submitted` may be lower than the batch size
    /// when some target clients vanished.
    Released { iteration: u32, submitted: usize },
}

struct Entry {
    strategy: ExecutionStrategy,
    queue: VecDeque<Cmd>,
    iteration: u32,
}

#[derive(Default)]
pub struct ExecutionCoordinator {
    entries: RwLock<HashMap<Uuid, Arc<Mutex<Entry>>>>,
}

impl ExecutionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `remaining` for later iterations of request `id`.
    ///
    /// Returns `false` and leaves the existing entry untouched when `id` is
    /// already registered.
    pub async fn add(&self, id: Uuid, strategy: ExecutionStrategy, remaining: Vec<Cmd>) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return false;
        }
        tracing::debug!(request_id = %id, queued = remaining.len(), %strategy, "coordinator entry added");
        entries.insert(
            id,
            Arc::new(Mutex::new(Entry {
                strategy,
                queue: remaining.into(),
                iteration: 0,
            })),
        );
        true
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    /// Commands still held back for request `id`.
    pub async fn queued(&self, id: Uuid) -> usize {
        let Some(entry) = self.entry(id).await else {
            return 0;
        };
        let entry = entry.lock().await;
        entry.queue.len()
    }

    async fn entry(&self, id: Uuid) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().await.get(&id).cloned()
    }

    /// Release the next batch of request `id` if the current one is terminal.
    ///
    /// The entry stays locked until every submission of the new batch has
    /// returned, so a concurrent call never sees a half-released iteration.
    pub async fn next(&self, id: Uuid, dispatcher: &dyn Dispatcher) -> NextOutcome {
        let Some(entry) = self.entry(id).await else {
            return NextOutcome::Drained;
        };
        let mut entry = entry.lock().await;
        if entry.queue.is_empty() {
            return NextOutcome::Drained;
        }

        let in_flight = dispatcher
            .dispatched(id, entry.iteration)
            .await
            .iter()
            .filter(|cmd| !cmd.is_terminal())
            .count();
        if in_flight > 0 {
            tracing::debug!(request_id = %id, iteration = entry.iteration, in_flight, "batch still running");
            return NextOutcome::Blocked;
        }

        let iteration = entry.iteration + 1;
        let n = entry.strategy.plan_batch(iteration, entry.queue.len());
        let batch: Vec<Cmd> = entry
            .queue
            .drain(..n)
            .map(|cmd| cmd.with_iteration(iteration))
            .collect();

        let results = futures::future::join_all(batch.into_iter().map(|cmd| async move {
            let cmd_id = cmd.id;
            let client_id = cmd.client_id.clone();
            dispatcher.submit(cmd).await.map_err(|e| (cmd_id, client_id, e))
        }))
        .await;

        let mut submitted = 0;
        for result in results {
            match result {
                Ok(()) => submitted += 1,
                Err((cmd_id, client_id, e)) => {
                    tracing::warn!(request_id = %id, cmd_id = %cmd_id, client_id = %client_id, "skipping command: {e}");
                }
            }
        }

        entry.iteration = iteration;
        tracing::info!(request_id = %id, iteration, submitted, remaining = entry.queue.len(), "released batch");
        NextOutcome::Released {
            iteration,
            submitted,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
