//! The `Cmd`: one signed, client-bound execution of a template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IndispensoError, Result};
use crate::signing;
use crate::types::CmdState;

// ---------------------------------------------------------------------------
// Cmd
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    pub id: Uuid,
    pub command: String,
    pub client_id: String,
    pub template_id: String,
    #[serde(default)]
    pub consensus_request_id: Option<Uuid>,
    #[serde(default)]
    pub execution_iteration_id: u32,
    #[serde(default)]
    pub signature: String,
    /// Seconds before the process is killed.
    pub timeout: u64,
    pub state: CmdState,
    #[serde(default)]
    pub previous_state: Option<CmdState>,
    #[serde(default)]
    pub request_user_id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub buf_output: Vec<String>,
    #[serde(default)]
    pub buf_output_err: Vec<String>,
}

impl Cmd {
    pub fn new(command: impl Into<String>, timeout: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            client_id: String::new(),
            template_id: String::new(),
            consensus_request_id: None,
            execution_iteration_id: 0,
            signature: String::new(),
            timeout,
            state: CmdState::Pending,
            previous_state: None,
            request_user_id: String::new(),
            created: Utc::now(),
            buf_output: Vec::new(),
            buf_output_err: Vec::new(),
        }
    }

    /// Bind the command to the rollout it belongs to.
    pub fn for_request(
        mut self,
        request_id: Uuid,
        template_id: impl Into<String>,
        client_id: impl Into<String>,
        request_user_id: impl Into<String>,
    ) -> Self {
        self.consensus_request_id = Some(request_id);
        self.template_id = template_id.into();
        self.client_id = client_id.into();
        self.request_user_id = request_user_id.into();
        self
    }

    /// A copy of this command tagged with a rollout iteration.
    ///
    /// The iteration is not covered by the signature, so re-tagging never
    /// requires re-signing.
    pub fn with_iteration(&self, iteration: u32) -> Self {
        Self {
            execution_iteration_id: iteration,
            ..self.clone()
        }
    }

    /// Expected signature for this command under `token`.
    ///
    /// Returns `None` when the token is not valid base64url, which callers
    /// must treat as "never valid".
    pub fn compute_hmac(&self, token: &str) -> Option<String> {
        let key = signing::decode_token(token)?;
        signing::hmac_b64(&key, &[self.command.as_bytes(), self.id.to_string().as_bytes()])
    }

    /// Sign the command for the client owning `token`.
    pub fn sign(&mut self, token: &str) {
        self.signature = self.compute_hmac(token).unwrap_or_default();
    }

    /// Check the carried signature against `token`. Empty signatures never verify.
    pub fn verify(&self, token: &str) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        match signing::decode_token(token) {
            Some(key) => signing::verify_b64(
                &key,
                &[self.command.as_bytes(), self.id.to_string().as_bytes()],
                &self.signature,
            ),
            None => false,
        }
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// Re-applying the current state is accepted as a no-op so that retried
    /// notifications stay idempotent. Returns whether the state changed.
    pub fn transition(&mut self, next: CmdState) -> Result<bool> {
        if self.state == next {
            return Ok(false);
        }
        if !self.state.can_transition_to(next) {
            return Err(IndispensoError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.previous_state = Some(self.state);
        self.state = next;
        Ok(true)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal(self.previous_state)
    }

    pub fn append_logs(&mut self, batch: &LogBatch) {
        self.buf_output.extend(batch.output.iter().cloned());
        self.buf_output_err.extend(batch.error.iter().cloned());
    }

    pub fn to_payload(&self) -> CmdPayload {
        CmdPayload {
            id: self.id,
            command: self.command.clone(),
            timeout: self.timeout,
            signature: self.signature.clone(),
            template_id: self.template_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A command as handed to a node by `GET client/{id}/cmds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CmdPayload {
    pub id: Uuid,
    pub command: String,
    pub timeout: u64,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub template_id: String,
}

impl CmdPayload {
    /// Rebuild a node-side command from the wire form.
    pub fn into_cmd(self, client_id: impl Into<String>) -> Cmd {
        let mut cmd = Cmd::new(self.command, self.timeout);
        cmd.id = self.id;
        cmd.signature = self.signature;
        cmd.template_id = self.template_id;
        cmd.client_id = client_id.into();
        cmd
    }
}

/// Body of `PUT client/{id}/cmd/{cmd}/logs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatch {
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub error: Vec<String>,
}

impl LogBatch {
    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.error.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> String {
        signing::generate_token()
    }

    #[test]
    fn signing_is_deterministic() {
        let token = token();
        let cmd = Cmd::new("uptime", 30);
        assert_eq!(cmd.compute_hmac(&token), cmd.compute_hmac(&token));
    }

    #[test]
    fn signed_cmd_verifies_for_its_client_only() {
        let mine = token();
        let theirs = token();
        let mut cmd = Cmd::new("service nginx reload", 30);
        cmd.sign(&mine);
        assert!(cmd.verify(&mine));
        assert!(!cmd.verify(&theirs));
    }

    #[test]
    fn altering_command_or_id_breaks_signature() {
        let token = token();
        let mut cmd = Cmd::new("echo hello", 30);
        cmd.sign(&token);

        let mut body = cmd.clone();
        body.command.push(' ');
        assert!(!body.verify(&token));

        let mut flipped = cmd.clone();
        flipped.command = "echo hellp".into();
        assert!(!flipped.verify(&token));

        let mut replay = cmd.clone();
        replay.id = Uuid::new_v4();
        assert!(!replay.verify(&token));
    }

    #[test]
    fn empty_or_undecodable_token_never_verifies() {
        let mut cmd = Cmd::new("ls", 5);
        cmd.sign("%%% not base64 %%%");
        assert!(cmd.signature.is_empty());
        assert!(!cmd.verify("%%% not base64 %%%"));
        assert!(!cmd.verify(&token()));
    }

    #[test]
    fn iteration_tagging_returns_new_value() {
        let token = token();
        let mut cmd = Cmd::new("ls", 5);
        cmd.sign(&token);
        let tagged = cmd.with_iteration(3);
        assert_eq!(cmd.execution_iteration_id, 0);
        assert_eq!(tagged.execution_iteration_id, 3);
        assert!(tagged.verify(&token));
    }

    #[test]
    fn transition_follows_table() {
        let mut cmd = Cmd::new("ls", 5);
        assert!(cmd.transition(CmdState::Validating).unwrap());
        assert!(!cmd.transition(CmdState::Validating).unwrap());
        let err = cmd.transition(CmdState::Finished).unwrap_err();
        assert!(matches!(err, IndispensoError::InvalidTransition { .. }));
        assert_eq!(cmd.state, CmdState::Validating);
        assert_eq!(cmd.previous_state, Some(CmdState::Pending));
    }

    #[test]
    fn payload_uses_pascal_case() {
        let cmd = Cmd::new("ls", 5);
        let json = serde_json::to_value(cmd.to_payload()).unwrap();
        assert_eq!(json["Command"], "ls");
        assert_eq!(json["Timeout"], 5);
        assert!(json.get("Id").is_some());
    }

    #[test]
    fn payload_rebuilds_cmd() {
        let token = token();
        let mut cmd = Cmd::new("whoami", 9);
        cmd.sign(&token);
        let rebuilt = cmd.to_payload().into_cmd("node-1");
        assert_eq!(rebuilt.id, cmd.id);
        assert_eq!(rebuilt.client_id, "node-1");
        assert!(rebuilt.verify(&token));
    }
}
