use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// CmdState
// ---------------------------------------------------------------------------

/// Execution state of a single command.
///
/// The happy path is
/// `pending → validating → starting → started_execution → finished_execution
/// → flushed_logs → finished`. Every legal edge is listed in
/// [`CmdState::successors`]; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdState {
    Pending,
    Validating,
    InvalidSignature,
    Starting,
    StartedExecution,
    FinishedExecution,
    FailedExecution,
    KilledExecution,
    FlushedLogs,
    Finished,
    FailedValidation,
}

impl CmdState {
    pub fn all() -> &'static [CmdState] {
        &[
            CmdState::Pending,
            CmdState::Validating,
            CmdState::InvalidSignature,
            CmdState::Starting,
            CmdState::StartedExecution,
            CmdState::FinishedExecution,
            CmdState::FailedExecution,
            CmdState::KilledExecution,
            CmdState::FlushedLogs,
            CmdState::Finished,
            CmdState::FailedValidation,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CmdState::Pending => "pending",
            CmdState::Validating => "validating",
            CmdState::InvalidSignature => "invalid_signature",
            CmdState::Starting => "starting",
            CmdState::StartedExecution => "started_execution",
            CmdState::FinishedExecution => "finished_execution",
            CmdState::FailedExecution => "failed_execution",
            CmdState::KilledExecution => "killed_execution",
            CmdState::FlushedLogs => "flushed_logs",
            CmdState::Finished => "finished",
            CmdState::FailedValidation => "failed_validation",
        }
    }

    /// States reachable in one step from `self`.
    pub fn successors(self) -> &'static [CmdState] {
        match self {
            CmdState::Pending => &[CmdState::Validating],
            CmdState::Validating => &[CmdState::Starting, CmdState::InvalidSignature],
            CmdState::Starting => &[CmdState::StartedExecution, CmdState::FailedExecution],
            CmdState::StartedExecution => &[
                CmdState::FinishedExecution,
                CmdState::FailedExecution,
                CmdState::KilledExecution,
            ],
            CmdState::FinishedExecution
            | CmdState::FailedExecution
            | CmdState::KilledExecution => &[CmdState::FlushedLogs],
            CmdState::FlushedLogs => &[CmdState::Finished, CmdState::FailedValidation],
            CmdState::InvalidSignature | CmdState::Finished | CmdState::FailedValidation => &[],
        }
    }

    pub fn can_transition_to(self, next: CmdState) -> bool {
        self.successors().contains(&next)
    }

    /// Whether a command in this state will see no further activity on its node.
    ///
    /// `previous` disambiguates `failed_execution`: coming straight from
    /// `starting` the process never ran, so no log flush will follow.
    pub fn is_terminal(self, previous: Option<CmdState>) -> bool {
        match self {
            CmdState::InvalidSignature
            | CmdState::FlushedLogs
            | CmdState::Finished
            | CmdState::FailedValidation => true,
            CmdState::FailedExecution => previous == Some(CmdState::Starting),
            _ => false,
        }
    }
}

impl fmt::Display for CmdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CmdState {
    type Err = crate::error::IndispensoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CmdState::all()
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::error::IndispensoError::InvalidState(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// OutputStream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputStream {
    type Err = crate::error::IndispensoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" | "1" => Ok(OutputStream::Stdout),
            "stderr" | "2" => Ok(OutputStream::Stderr),
            _ => Err(crate::error::IndispensoError::InvalidOutputStream(
                s.to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
