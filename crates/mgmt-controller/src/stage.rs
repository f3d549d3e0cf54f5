//! Execution stages
//!
//! A context moves `Model -> Runtime -> Verify -> Completed`, and may leave
//! any non-terminal stage for `RolledBack`. Nothing else is legal.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Stage of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Validate parameters and mutate the working model
    Model,
    /// Apply the change to live services
    Runtime,
    /// Kernel-only consistency check
    Verify,
    /// Committed
    Completed,
    /// Rolled back after a failure
    RolledBack,
}

impl Stage {
    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }

    /// Stages in which handler code runs
    #[inline]
    #[must_use]
    pub fn runs_handlers(self) -> bool {
        matches!(self, Self::Model | Self::Runtime)
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Model => "MODEL",
            Self::Runtime => "RUNTIME",
            Self::Verify => "VERIFY",
            Self::Completed => "COMPLETED",
            Self::RolledBack => "ROLLED-BACK",
        };
        f.write_str(name)
    }
}

/// What a registered handler is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageAffinity {
    /// Reads only; takes no locks
    ReadOnly,
    /// Mutates the model during MODEL
    Model,
    /// Mutates the model and may schedule RUNTIME work
    Runtime,
}

impl StageAffinity {
    /// Whether the handler may touch the model
    #[inline]
    #[must_use]
    pub fn may_write(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }

    /// Whether the handler may add RUNTIME steps
    #[inline]
    #[must_use]
    pub fn may_schedule_runtime(self) -> bool {
        matches!(self, Self::Runtime)
    }
}

/// Stages reachable from `from`
pub fn allowed_transitions(from: Stage) -> Vec<Stage> {
    use Stage::*;
    match from {
        Model => vec![Runtime, RolledBack],
        Runtime => vec![Verify, RolledBack],
        Verify => vec![Completed, RolledBack],
        Completed | RolledBack => vec![],
    }
}

/// # Errors
/// [`StageError::IllegalTransition`] when `to` is not reachable from `from`.
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), StageError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StageError::IllegalTransition { from, to })
    }
}

/// Stage machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Transition outside the table
    #[error("illegal stage transition {from} -> {to}")]
    IllegalTransition {
        /// Current stage
        from: Stage,
        /// Requested stage
        to: Stage,
    },
}
