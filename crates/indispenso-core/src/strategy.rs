//! Rollout batch-size policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IndispensoError;

/// How the commands of an approved request are spread over iterations.
///
/// Iteration 0 is released by the strategy itself when the request reaches
/// quorum; later iterations are released by the coordinator once the
/// previous batch is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Everything at once.
    #[default]
    Simple,
    /// One test host, then the rest.
    Canary,
    /// One test host, then fixed-size batches.
    Rolling { batch_size: usize },
    /// One test host, then batches doubling per iteration (2, 4, 8, ...).
    ExponentialRolling,
}

impl ExecutionStrategy {
    /// Number of commands to release at `iteration` with `remaining` queued.
    ///
    /// Never exceeds `remaining`, and is at least 1 whenever anything remains.
    pub fn plan_batch(&self, iteration: u32, remaining: usize) -> usize {
        if remaining == 0 {
            return 0;
        }
        let wanted = match self {
            ExecutionStrategy::Simple => remaining,
            ExecutionStrategy::Canary => {
                if iteration == 0 {
                    1
                } else {
                    remaining
                }
            }
            ExecutionStrategy::Rolling { batch_size } => {
                if iteration == 0 {
                    1
                } else {
                    (*batch_size).max(1)
                }
            }
            ExecutionStrategy::ExponentialRolling => {
                // 2^iteration, saturating well before it could overflow.
                1usize.checked_shl(iteration.min(63)).unwrap_or(usize::MAX)
            }
        };
        wanted.min(remaining)
    }

    /// Whether later iterations go through the coordinator.
    pub fn is_phased(&self) -> bool {
        !matches!(self, ExecutionStrategy::Simple)
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::Simple => f.write_str("simple"),
            ExecutionStrategy::Canary => f.write_str("canary"),
            ExecutionStrategy::Rolling { batch_size } => write!(f, "rolling({batch_size})"),
            ExecutionStrategy::ExponentialRolling => f.write_str("exponential_rolling"),
        }
    }
}

impl FromStr for ExecutionStrategy {
    type Err = IndispensoError;

    /// Accepts the `Display` forms: `simple`, `canary`, `rolling(N)` and
    /// `exponential_rolling`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => return Ok(ExecutionStrategy::Simple),
            "canary" => return Ok(ExecutionStrategy::Canary),
            "exponential_rolling" => return Ok(ExecutionStrategy::ExponentialRolling),
            _ => {}
        }
        let batch_size = s
            .strip_prefix("rolling(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| IndispensoError::InvalidStrategy(s.to_string()))?
            .parse::<usize>()
            .map_err(|_| IndispensoError::InvalidStrategy(s.to_string()))?;
        if batch_size == 0 {
            return Err(IndispensoError::InvalidStrategy(
                "rolling batch size must be at least 1".into(),
            ));
        }
        Ok(ExecutionStrategy::Rolling { batch_size })
    }
}
