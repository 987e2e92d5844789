use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{AgentError, Result};

/// How long the output streams may stay open after the child is gone, e.g.
/// held by a daemon the script started.
const READER_GRACE: Duration = Duration::from_secs(2);

// ─── Script ───────────────────────────────────────────────────────────────

/// A command body written to `<dir>/indispenso_<id>`, removed on drop.
pub struct Script {
    path: PathBuf,
}

impl Script {
    pub fn write(dir: &Path, id: Uuid, command: &str) -> Result<Self> {
        let path = dir.join(format!("indispenso_{id}"));
        let body = format!("#!/bin/bash\n{command}");
        indispenso_core::io::write_private(&path, body.as_bytes())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "failed to remove script: {e}");
            }
        }
    }
}

// ─── ScriptProcess ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exited { success: bool, code: Option<i32> },
    /// The timeout fired and the process group was killed.
    Killed,
}

#[derive(Debug)]
pub struct ScriptOutput {
    pub outcome: Outcome,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// A running `bash <script>` child, leader of its own process group.
pub struct ScriptProcess {
    child: Child,
    stdout: LineReader,
    stderr: LineReader,
}

impl ScriptProcess {
    pub fn spawn(script: &Script) -> Result<Self> {
        let mut cmd = Command::new("bash");
        cmd.arg(script.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Process("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Process("stderr not captured".into()))?;

        Ok(Self {
            child,
            stdout: LineReader::spawn(stdout),
            stderr: LineReader::spawn(stderr),
        })
    }

    /// Wait for the child, killing its whole process group after `timeout`.
    ///
    /// A failed kill is returned as an error and the child is left alone.
    pub async fn wait(mut self, timeout: Duration) -> Result<ScriptOutput> {
        let outcome = tokio::select! {
            status = self.child.wait() => {
                let status = status?;
                Outcome::Exited { success: status.success(), code: status.code() }
            }
            _ = tokio::time::sleep(timeout) => {
                self.kill_group()?;
                self.child.wait().await?;
                Outcome::Killed
            }
        };

        let (stdout, stderr) = tokio::join!(
            self.stdout.finish(READER_GRACE),
            self.stderr.finish(READER_GRACE)
        );
        Ok(ScriptOutput {
            outcome,
            stdout,
            stderr,
        })
    }

    #[cfg(unix)]
    fn kill_group(&mut self) -> Result<()> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| AgentError::Process("child already reaped".into()))?;
        let pgid = i32::try_from(pid)
            .map_err(|_| AgentError::Process(format!("pid {pid} out of range")))?;
        // SAFETY: plain syscall; a negative pid addresses the process group
        // the child leads since it was spawned with process_group(0).
        let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if rc != 0 {
            return Err(AgentError::Process(format!(
                "kill of process group {pgid} failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }
}

// ─── LineReader ───────────────────────────────────────────────────────────

/// Reads one output stream into a shared buffer, so lines read so far
/// survive a reader that never sees end of stream.
struct LineReader {
    lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl LineReader {
    fn spawn(reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(collect_lines(reader, lines.clone()));
        Self { lines, task }
    }

    /// Wait up to `grace` for end of stream, then hand back whatever was read.
    async fn finish(mut self, grace: Duration) -> Vec<String> {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("output reader failed: {e}"),
            Err(_) => {
                tracing::warn!("output stream still open, keeping the lines read so far");
                self.task.abort();
            }
        }
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *lines)
    }
}

async fn collect_lines(reader: impl AsyncRead + Unpin, sink: Arc<Mutex<Vec<String>>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                sink.lock().unwrap_or_else(|e| e.into_inner()).push(line);
            }
            Err(e) => {
                tracing::warn!("failed to read command output: {e}");
                break;
            }
        }
    }
}

/// Strip the line ending; bytes that are not UTF-8 become U+FFFD.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

// ─── Tests ────────────────────────────────────────────────────────────────
