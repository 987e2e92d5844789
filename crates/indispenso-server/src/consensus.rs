//! Pending approval requests and their quorum.

use chrono::{DateTime, Utc};
use indispenso_core::error::{IndispensoError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

/// Listener run once when a request's rollout has finished.
pub type CompletionCallback = Box<dyn FnOnce(&ConsensusRequest) + Send>;

// ---------------------------------------------------------------------------
// ConsensusRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusRequest {
    pub id: Uuid,
    pub template_id: String,
    pub client_ids: Vec<String>,
    pub request_user_id: String,
    pub reason: String,
    /// Distinct approvers, in approval order. Never contains the requester.
    pub approve_user_ids: Vec<String>,
    pub executed: bool,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl ConsensusRequest {
    /// The requester's own vote plus every approval.
    pub fn votes(&self) -> u32 {
        1 + self.approve_user_ids.len() as u32
    }
}

/// Result of an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    /// Quorum not reached yet.
    Pending { votes: u32, needed: u32 },
    /// This approval reached quorum; the caller must start the rollout.
    Reached,
    /// The rollout already started.
    AlreadyExecuted,
}

// ---------------------------------------------------------------------------
// ConsensusRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ConsensusRegistry {
    requests: RwLock<HashMap<Uuid, ConsensusRequest>>,
    callbacks: StdMutex<HashMap<Uuid, Vec<CompletionCallback>>>,
}

impl ConsensusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_request(
        &self,
        template_id: impl Into<String>,
        client_ids: Vec<String>,
        request_user_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> ConsensusRequest {
        let request = ConsensusRequest {
            id: Uuid::new_v4(),
            template_id: template_id.into(),
            client_ids,
            request_user_id: request_user_id.into(),
            reason: reason.into(),
            approve_user_ids: Vec::new(),
            executed: false,
            created: Utc::now(),
            started: None,
            completed: None,
        };
        self.requests
            .write()
            .await
            .insert(request.id, request.clone());
        tracing::info!(
            request_id = %request.id,
            template_id = %request.template_id,
            user = %request.request_user_id,
            "consensus request added"
        );
        request
    }

    pub async fn get(&self, id: Uuid) -> Option<ConsensusRequest> {
        self.requests.read().await.get(&id).cloned()
    }

    /// Requests still waiting for quorum, oldest first.
    pub async fn pending(&self) -> Vec<ConsensusRequest> {
        let mut out: Vec<ConsensusRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| !r.executed)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created);
        out
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Record `user`'s approval and compare the vote count against `needed`.
    ///
    /// The `executed` flag flips under the registry write lock, so exactly
    /// one caller ever sees [`Approval::Reached`] for a request.
    pub async fn approve(&self, id: Uuid, user: &str, needed: u32) -> Result<Approval> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| IndispensoError::RequestNotFound(id.to_string()))?;
        if request.executed {
            return Ok(Approval::AlreadyExecuted);
        }
        if request.request_user_id == user {
            return Err(IndispensoError::SelfApproval(user.to_string()));
        }
        if !request.approve_user_ids.iter().any(|u| u == user) {
            request.approve_user_ids.push(user.to_string());
        }
        let votes = request.votes();
        if votes < needed {
            return Ok(Approval::Pending { votes, needed });
        }
        request.executed = true;
        request.started = Some(Utc::now());
        tracing::info!(request_id = %id, votes, "consensus reached");
        Ok(Approval::Reached)
    }

    /// Register a listener for the end of the rollout.
    pub fn on_complete(&self, id: Uuid, callback: CompletionCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_default()
            .push(callback);
    }

    /// A receiver that resolves once the request completes.
    ///
    /// Wrap it in `tokio::time::timeout` to wait within a bounded window.
    pub async fn completion(&self, id: Uuid) -> Result<oneshot::Receiver<()>> {
        if self.get(id).await.is_none() {
            return Err(IndispensoError::RequestNotFound(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.on_complete(
            id,
            Box::new(move |_: &ConsensusRequest| {
                let _ = tx.send(());
            }),
        );
        Ok(rx)
    }

    /// Stamp the request complete and run its callbacks in registration
    /// order. Returns `false` when it had already completed.
    pub async fn complete(&self, id: Uuid) -> Result<bool> {
        let snapshot = {
            let mut requests = self.requests.write().await;
            let request = requests
                .get_mut(&id)
                .ok_or_else(|| IndispensoError::RequestNotFound(id.to_string()))?;
            if request.completed.is_some() {
                return Ok(false);
            }
            request.completed = Some(Utc::now());
            request.clone()
        };
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .unwrap_or_default();
        tracing::info!(request_id = %id, callbacks = callbacks.len(), "rollout complete");
        for callback in callbacks {
            callback(&snapshot);
        }
        Ok(true)
    }

    /// Remove a request. Its callbacks are dropped without running.
    pub async fn cancel(&self, id: Uuid) -> Result<ConsensusRequest> {
        let removed = self
            .requests
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| IndispensoError::RequestNotFound(id.to_string()))?;
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        tracing::info!(request_id = %id, "consensus request cancelled");
        Ok(removed)
    }

    /// Drop requests created before `now - max_age`, except rollouts still
    /// in flight. Returns the removed ids.
    pub async fn prune(&self, max_age: chrono::Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - max_age;
        let mut requests = self.requests.write().await;
        let stale: Vec<Uuid> = requests
            .values()
            .filter(|r| r.created < cutoff && (!r.executed || r.completed.is_some()))
            .map(|r| r.id)
            .collect();
        for id in &stale {
            requests.remove(id);
        }
        drop(requests);
        if !stale.is_empty() {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            for id in &stale {
                callbacks.remove(id);
            }
            tracing::info!(count = stale.len(), "pruned stale consensus requests");
        }
        stale
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: Uuid, by: chrono::Duration) {
        if let Some(r) = self.requests.write().await.get_mut(&id) {
            r.created -= by;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn requester_counts_as_first_vote() {
        let reg = ConsensusRegistry::new();
        let r = reg.add_request("t", vec!["n1".into()], "alice", "").await;
        assert_eq!(r.votes(), 1);
        assert_eq!(reg.approve(r.id, "bob", 2).await.unwrap(), Approval::Reached);
        assert!(reg.get(r.id).await.unwrap().executed);
    }

    #[tokio::test]
    async fn requester_cannot_approve_own_request() {
        let reg = ConsensusRegistry::new();
        let r = reg.add_request("t", vec![], "alice", "").await;
        assert!(matches!(
            reg.approve(r.id, "alice", 2).await,
            Err(IndispensoError::SelfApproval(_))
        ));
    }

    #[tokio::test]
    async fn repeated_approval_counts_once() {
        let reg = ConsensusRegistry::new();
        let r = reg.add_request("t", vec![], "alice", "").await;
        assert_eq!(
            reg.approve(r.id, "bob", 3).await.unwrap(),
            Approval::Pending { votes: 2, needed: 3 }
        );
        assert_eq!(
            reg.approve(r.id, "bob", 3).await.unwrap(),
            Approval::Pending { votes: 2, needed: 3 }
        );
        assert_eq!(reg.approve(r.id, "carol", 3).await.unwrap(), Approval::Reached);
        assert_eq!(
            reg.approve(r.id, "dave", 3).await.unwrap(),
            Approval::AlreadyExecuted
        );
    }

    #[tokio::test]
    async fn quorum_is_reached_exactly_once_under_contention() {
        let reg = Arc::new(ConsensusRegistry::new());
        let r = reg.add_request("t", vec![], "alice", "").await;
        let mut handles = Vec::new();
        for i in 0..50 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.approve(r.id, &format!("user-{i}"), 3).await.unwrap()
            }));
        }
        let mut reached = 0;
        for h in handles {
            if h.await.unwrap() == Approval::Reached {
                reached += 1;
            }
        }
        assert_eq!(reached, 1);
    }

    #[tokio::test]
    async fn ten_thousand_concurrent_adds_keep_unique_ids() {
        let reg = Arc::new(ConsensusRegistry::new());
        let mut handles = Vec::with_capacity(10_000);
        for i in 0..10_000 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.add_request("t", vec![], format!("user-{i}"), "").await.id
            }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            assert!(ids.insert(h.await.unwrap()));
        }
        assert_eq!(ids.len(), 10_000);
        assert_eq!(reg.len().await, 10_000);
    }

    #[tokio::test]
    async fn callbacks_run_once_in_order() {
        let reg = ConsensusRegistry::new();
        let r = reg.add_request("t", vec![], "alice", "").await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for n in 0..3 {
            let seen = seen.clone();
            reg.on_complete(
                r.id,
                Box::new(move |_: &ConsensusRequest| seen.lock().unwrap().push(n)),
            );
        }
        assert!(reg.complete(r.id).await.unwrap());
        assert!(!reg.complete(r.id).await.unwrap());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert!(reg.get(r.id).await.unwrap().completed.is_some());
    }

    #[tokio::test]
    async fn completion_receiver_resolves() {
        let reg = ConsensusRegistry::new();
        let r = reg.add_request("t", vec![], "alice", "").await;
        let rx = reg.completion(r.id).await.unwrap();
        reg.complete(r.id).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_removes_request() {
        let reg = ConsensusRegistry::new();
        let r = reg.add_request("t", vec![], "alice", "").await;
        reg.cancel(r.id).await.unwrap();
        assert!(reg.get(r.id).await.is_none());
        assert!(reg.cancel(r.id).await.is_err());
    }

    #[tokio::test]
    async fn prune_drops_only_stale_requests() {
        let reg = ConsensusRegistry::new();
        let old = reg.add_request("t", vec![], "alice", "").await;
        let fresh = reg.add_request("t", vec![], "alice", "").await;
        reg.backdate(old.id, chrono::Duration::days(15)).await;

        let pruned = reg.prune(chrono::Duration::days(14)).await;
        assert_eq!(pruned, vec![old.id]);
        assert!(reg.get(fresh.id).await.is_some());
        assert_eq!(reg.pending().await.len(), 1);
    }
}
