//! Application context: templates, clients, consensus and rollout sequencing.

use indispenso_core::cmd::{Cmd, LogBatch};
use indispenso_core::config::Config;
use indispenso_core::error::{IndispensoError, Result};
use indispenso_core::template::TemplateStore;
use indispenso_core::types::CmdState;
use indispenso_core::validation;
use std::sync::Arc;
use uuid::Uuid;

use crate::consensus::{Approval, ConsensusRegistry, ConsensusRequest};
use crate::coordinator::{ExecutionCoordinator, NextOutcome};
use crate::registry::ClientRegistry;

pub struct Engine {
    pub config: Config,
    pub templates: Arc<dyn TemplateStore>,
    pub clients: ClientRegistry,
    pub consensus: ConsensusRegistry,
    pub coordinator: ExecutionCoordinator,
}

impl Engine {
    pub fn new(config: Config, templates: Arc<dyn TemplateStore>) -> Self {
        let clients = ClientRegistry::new(config.token.clone());
        Self {
            config,
            templates,
            clients,
            consensus: ConsensusRegistry::new(),
            coordinator: ExecutionCoordinator::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Consensus
    // -----------------------------------------------------------------------

    /// Open a request to run `template_id` on `client_ids`.
    pub async fn request(
        &self,
        template_id: &str,
        client_ids: Vec<String>,
        user: &str,
        reason: &str,
    ) -> Result<ConsensusRequest> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| IndispensoError::TemplateNotFound(template_id.to_string()))?;
        if !template.enabled {
            return Err(IndispensoError::TemplateDisabled(template_id.to_string()));
        }
        Ok(self
            .consensus
            .add_request(template_id, client_ids, user, reason)
            .await)
    }

    /// Votes needed for a request on `template_id`, the requester included.
    pub fn quorum(&self, template_id: &str) -> u32 {
        self.templates
            .get(template_id)
            .and_then(|t| t.min_auth)
            .unwrap_or(self.config.consensus.default_min_auth)
    }

    /// Approve request `id` as `user`; starts the rollout once quorum is reached.
    pub async fn approve(&self, id: Uuid, user: &str) -> Result<Approval> {
        let request = self
            .consensus
            .get(id)
            .await
            .ok_or_else(|| IndispensoError::RequestNotFound(id.to_string()))?;
        let needed = self.quorum(&request.template_id);
        let outcome = self.consensus.approve(id, user, needed).await?;
        if outcome == Approval::Reached {
            if let Err(e) = self.execute(&request).await {
                // Nothing was dispatched; close the request so waiters are
                // released and prune can drop it.
                tracing::error!(request_id = %id, "rollout failed to start: {e}");
                self.coordinator.remove(id).await;
                if let Err(err) = self.consensus.complete(id).await {
                    tracing::debug!(request_id = %id, "not completing: {err}");
                }
                return Err(e);
            }
        }
        Ok(outcome)
    }

    /// Remove a request together with its queued and dispatched commands.
    pub async fn cancel(&self, id: Uuid) -> Result<ConsensusRequest> {
        let request = self.consensus.cancel(id).await?;
        self.coordinator.remove(id).await;
        let removed = self.clients.remove_request_cmds(id).await;
        tracing::info!(request_id = %id, removed, "cancelled rollout");
        Ok(request)
    }

    pub async fn prune(&self) -> usize {
        let pruned = self.consensus.prune(self.config.consensus.max_age()).await;
        for id in &pruned {
            self.coordinator.remove(*id).await;
            self.clients.remove_request_cmds(*id).await;
        }
        pruned.len()
    }

    // -----------------------------------------------------------------------
    // Strategy execution
    // -----------------------------------------------------------------------

    /// Build, sign and submit the commands of an approved request.
    ///
    /// Returns the number of commands built. Batches after the first are
    /// handed to the coordinator.
    pub async fn execute(&self, request: &ConsensusRequest) -> Result<usize> {
        let template = self
            .templates
            .get(&request.template_id)
            .ok_or_else(|| IndispensoError::TemplateNotFound(request.template_id.clone()))?;

        let mut cmds = Vec::with_capacity(request.client_ids.len());
        for client_id in &request.client_ids {
            let Some(client) = self.clients.get(client_id).await else {
                tracing::warn!(request_id = %request.id, client_id = %client_id, "unknown client, skipping");
                continue;
            };
            let mut cmd = Cmd::new(template.command.clone(), template.timeout).for_request(
                request.id,
                template.id.clone(),
                client.id.clone(),
                request.request_user_id.clone(),
            );
            match client.auth_token.as_deref() {
                Some(token) => cmd.sign(token),
                None => {
                    tracing::warn!(client_id = %client.id, cmd_id = %cmd.id, "client has no auth token, command is unsigned")
                }
            }
            cmds.push(cmd);
        }

        let total = cmds.len();
        if total == 0 {
            tracing::warn!(request_id = %request.id, "no commands built");
            self.consensus.complete(request.id).await?;
            return Ok(0);
        }

        let strategy = template.execution_strategy;
        let first = strategy.plan_batch(0, total);
        let rest = cmds.split_off(first);
        if !rest.is_empty() {
            // Registered before submitting so an early terminal state cannot
            // complete the request while batches are still held back.
            self.coordinator.add(request.id, strategy, rest).await;
        }

        let mut submitted = 0;
        for cmd in cmds {
            let cmd_id = cmd.id;
            match self.clients.submit(cmd).await {
                Ok(()) => submitted += 1,
                Err(e) => tracing::warn!(request_id = %request.id, cmd_id = %cmd_id, "skipping command: {e}"),
            }
        }
        tracing::info!(
            request_id = %request.id,
            %strategy,
            total,
            submitted,
            "rollout started"
        );
        if submitted == 0 {
            self.advance(request.id).await;
        }
        Ok(total)
    }

    /// Release the next batch or complete the request, as far as the
    /// current command states allow.
    pub async fn advance(&self, request_id: Uuid) {
        loop {
            match self.coordinator.next(request_id, &self.clients).await {
                NextOutcome::Blocked => return,
                NextOutcome::Released { submitted: 0, .. } => continue,
                NextOutcome::Released { .. } => return,
                NextOutcome::Drained => break,
            }
        }

        let cmds = self.clients.cmds_for_request(request_id).await;
        if !cmds.iter().all(Cmd::is_terminal) {
            return;
        }
        self.coordinator.remove(request_id).await;
        match self.consensus.complete(request_id).await {
            Ok(true) => tracing::info!(request_id = %request_id, cmds = cmds.len(), "request finished"),
            Ok(false) => {}
            Err(e) => tracing::debug!(request_id = %request_id, "not completing: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Node reports
    // -----------------------------------------------------------------------

    /// Apply a state notification from a node.
    ///
    /// Runs output validation on `finished_execution → flushed_logs` and
    /// advances the rollout whenever the command becomes terminal.
    pub async fn record_state(&self, client_id: &str, cmd_id: Uuid, state: CmdState) -> Result<Cmd> {
        let (changed, mut cmd) = self
            .clients
            .update_cmd(client_id, cmd_id, |cmd| {
                cmd.transition(state).map(|changed| (changed, cmd.clone()))
            })
            .await??;
        if !changed {
            return Ok(cmd);
        }
        tracing::info!(cmd_id = %cmd_id, client_id = %client_id, state = %state, "command state");

        if state == CmdState::FlushedLogs
            && cmd.previous_state == Some(CmdState::FinishedExecution)
        {
            match self.templates.get(&cmd.template_id) {
                Some(template) => {
                    let verdict = validation::validate(&cmd, &template);
                    cmd = self
                        .clients
                        .update_cmd(client_id, cmd_id, |c| {
                            c.transition(verdict).map(|_| c.clone())
                        })
                        .await??;
                    tracing::info!(cmd_id = %cmd_id, state = %verdict, "validated command");
                }
                None => {
                    tracing::error!(cmd_id = %cmd_id, template_id = %cmd.template_id, "template missing, skipping validation");
                }
            }
        }

        if cmd.is_terminal() {
            if let Some(request_id) = cmd.consensus_request_id {
                self.advance(request_id).await;
            }
        }
        Ok(cmd)
    }

    pub async fn record_logs(&self, client_id: &str, cmd_id: Uuid, batch: &LogBatch) -> Result<()> {
        self.clients
            .update_cmd(client_id, cmd_id, |cmd| cmd.append_logs(batch))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
