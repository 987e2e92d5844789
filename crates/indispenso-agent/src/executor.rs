//! The node side of a command's lifecycle.

use indispenso_core::cmd::Cmd;
use indispenso_core::types::{CmdState, OutputStream};
use std::path::Path;
use std::time::Duration;

use crate::logs::LogBuffer;
use crate::process::{Outcome, Script, ScriptProcess};
use crate::transport::ServerLink;

/// Runs one delivered command and reports every step to the server.
pub struct Executor<'a> {
    link: &'a dyn ServerLink,
    tmp_dir: &'a Path,
    /// Per-client token; `None` runs unverified commands.
    auth_token: Option<&'a str>,
}

impl<'a> Executor<'a> {
    pub fn new(link: &'a dyn ServerLink, tmp_dir: &'a Path, auth_token: Option<&'a str>) -> Self {
        Self {
            link,
            tmp_dir,
            auth_token,
        }
    }

    /// Execute `cmd`, returning the last state it reached on this node.
    pub async fn execute(&self, cmd: &mut Cmd) -> CmdState {
        tracing::info!(cmd_id = %cmd.id, command = %cmd.command, "executing command");

        self.notify(cmd, CmdState::Validating).await;
        match self.auth_token {
            Some(token) if !cmd.verify(token) => {
                tracing::error!(
                    cmd_id = %cmd.id,
                    "invalid command signature, communication with the server may be tampered with"
                );
                self.notify(cmd, CmdState::InvalidSignature).await;
                return cmd.state;
            }
            Some(_) => {}
            None => tracing::warn!(cmd_id = %cmd.id, "no client token, executing unverified command"),
        }

        self.notify(cmd, CmdState::Starting).await;
        let script = match Script::write(self.tmp_dir, cmd.id, &cmd.command) {
            Ok(script) => script,
            Err(e) => {
                tracing::error!(cmd_id = %cmd.id, "failed to write script: {e}");
                self.notify(cmd, CmdState::FailedExecution).await;
                return cmd.state;
            }
        };
        let process = match ScriptProcess::spawn(&script) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(cmd_id = %cmd.id, "failed to start command: {e}");
                self.notify(cmd, CmdState::FailedExecution).await;
                return cmd.state;
            }
        };

        self.notify(cmd, CmdState::StartedExecution).await;
        let output = match process.wait(Duration::from_secs(cmd.timeout)).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(cmd_id = %cmd.id, "failed to stop command: {e}");
                return cmd.state;
            }
        };
        let finished = match output.outcome {
            Outcome::Killed => {
                tracing::warn!(cmd_id = %cmd.id, timeout = cmd.timeout, "command timed out, killed");
                CmdState::KilledExecution
            }
            Outcome::Exited { success: true, .. } => {
                tracing::info!(cmd_id = %cmd.id, "command finished");
                CmdState::FinishedExecution
            }
            Outcome::Exited { code, .. } => {
                tracing::warn!(cmd_id = %cmd.id, ?code, "command failed");
                CmdState::FailedExecution
            }
        };
        self.notify(cmd, finished).await;

        let mut logs = LogBuffer::new();
        let lines = output
            .stdout
            .into_iter()
            .map(|l| (OutputStream::Stdout, l))
            .chain(output.stderr.into_iter().map(|l| (OutputStream::Stderr, l)));
        for (stream, line) in lines {
            match stream {
                OutputStream::Stdout => cmd.buf_output.push(line.clone()),
                OutputStream::Stderr => cmd.buf_output_err.push(line.clone()),
            }
            if let Some(batch) = logs.push(stream, line) {
                self.flush(cmd, batch).await;
            }
        }
        let rest = logs.take();
        self.flush(cmd, rest).await;

        self.notify(cmd, CmdState::FlushedLogs).await;
        drop(script);
        cmd.state
    }

    /// Record `state` locally and tell the server. Delivery failures are
    /// logged; the command carries on.
    async fn notify(&self, cmd: &mut Cmd, state: CmdState) {
        if let Err(e) = cmd.transition(state) {
            tracing::error!(cmd_id = %cmd.id, "local state change rejected: {e}");
            return;
        }
        if let Err(e) = self.link.notify_state(cmd.id, state).await {
            tracing::error!(cmd_id = %cmd.id, state = %state, "failed to notify server: {e}");
        }
    }

    async fn flush(&self, cmd: &Cmd, batch: indispenso_core::cmd::LogBatch) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.link.flush_logs(cmd.id, &batch).await {
            tracing::error!(cmd_id = %cmd.id, lines = batch.output.len() + batch.error.len(), "failed to flush logs: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::Result;
    use async_trait::async_trait;
    use indispenso_core::cmd::LogBatch;
    use indispenso_core::signing;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<CmdState>>,
        flushes: Mutex<Vec<LogBatch>>,
    }

    impl Recorder {
        fn states(&self) -> Vec<CmdState> {
            self.states.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServerLink for Recorder {
        async fn notify_state(&self, _cmd_id: Uuid, state: CmdState) -> Result<()> {
            self.states.lock().unwrap().push(state);
            Ok(())
        }

        async fn flush_logs(&self, _cmd_id: Uuid, batch: &LogBatch) -> Result<()> {
            self.flushes.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    fn signed(command: &str, timeout: u64, token: &str) -> Cmd {
        let mut cmd = Cmd::new(command, timeout);
        cmd.sign(token);
        cmd
    }

    #[tokio::test]
    async fn successful_run_walks_the_happy_path() {
        let dir = TempDir::new().unwrap();
        let token = signing::generate_token();
        let link = Recorder::default();
        let mut cmd = signed("echo OK", 10, &token);

        let end = Executor::new(&link, dir.path(), Some(token.as_str()))
            .execute(&mut cmd)
            .await;

        assert_eq!(end, CmdState::FlushedLogs);
        assert_eq!(
            link.states(),
            vec![
                CmdState::Validating,
                CmdState::Starting,
                CmdState::StartedExecution,
                CmdState::FinishedExecution,
                CmdState::FlushedLogs,
            ]
        );
        assert_eq!(cmd.buf_output, vec!["OK".to_string()]);
        let flushes = link.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].output, vec!["OK".to_string()]);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn tampered_command_never_starts() {
        let dir = TempDir::new().unwrap();
        let token = signing::generate_token();
        let link = Recorder::default();
        let mut cmd = signed("echo hello", 10, &token);
        cmd.command = "echo hellp".into();

        let end = Executor::new(&link, dir.path(), Some(token.as_str()))
            .execute(&mut cmd)
            .await;

        assert_eq!(end, CmdState::InvalidSignature);
        assert_eq!(
            link.states(),
            vec![CmdState::Validating, CmdState::InvalidSignature]
        );
        assert!(!link.states().contains(&CmdState::StartedExecution));
    }

    #[tokio::test]
    async fn empty_signature_is_rejected() {
        let dir = TempDir::new().unwrap();
        let link = Recorder::default();
        let mut cmd = Cmd::new("true", 10);
        let token = signing::generate_token();

        let end = Executor::new(&link, dir.path(), Some(token.as_str()))
            .execute(&mut cmd)
            .await;
        assert_eq!(end, CmdState::InvalidSignature);
    }

    #[tokio::test]
    async fn timeout_ends_killed() {
        let dir = TempDir::new().unwrap();
        let token = signing::generate_token();
        let link = Recorder::default();
        let mut cmd = signed("sleep 5", 1, &token);

        let started = std::time::Instant::now();
        Executor::new(&link, dir.path(), Some(token.as_str()))
            .execute(&mut cmd)
            .await;

        assert!(started.elapsed() < Duration::from_secs(4));
        let states = link.states();
        assert!(states.contains(&CmdState::KilledExecution));
        assert_eq!(states.last(), Some(&CmdState::FlushedLogs));
        assert_eq!(cmd.previous_state, Some(CmdState::KilledExecution));
    }

    #[tokio::test]
    async fn failing_command_reports_failed_execution() {
        let dir = TempDir::new().unwrap();
        let link = Recorder::default();
        let mut cmd = Cmd::new("echo boom >&2; exit 1", 10);

        Executor::new(&link, dir.path(), None).execute(&mut cmd).await;

        assert!(link.states().contains(&CmdState::FailedExecution));
        assert_eq!(cmd.buf_output_err, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn long_output_flushes_in_batches() {
        let dir = TempDir::new().unwrap();
        let link = Recorder::default();
        let mut cmd = Cmd::new("for i in $(seq 1 15); do echo line $i; done", 10);

        Executor::new(&link, dir.path(), None).execute(&mut cmd).await;

        let flushes = link.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].output.len(), 11);
        assert_eq!(flushes[1].output.len(), 4);
        assert_eq!(cmd.buf_output.len(), 15);
    }

    #[tokio::test]
    async fn missing_tmp_dir_fails_execution() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("does-not-exist");
        let link = Recorder::default();
        let mut cmd = Cmd::new("true", 10);

        let end = Executor::new(&link, &gone, None).execute(&mut cmd).await;

        assert_eq!(end, CmdState::FailedExecution);
        assert!(cmd.is_terminal());
        assert_eq!(
            link.states(),
            vec![CmdState::Validating, CmdState::Starting, CmdState::FailedExecution]
        );
    }
}
