//! Submission outcomes

use crate::error::FailureKind;
use mgmt_model::{ModelValue, PathAddress};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Overall outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Committed
    Success,
    /// Failed; see the report
    Failed,
}

impl Outcome {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// What happened to the effects of a failed submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStatus {
    /// Nothing had been changed
    NotRequired,
    /// Every compensating action succeeded
    Clean,
    /// Secondary failures raised while rolling back
    Failed(Vec<String>),
}

impl RollbackStatus {
    /// Whether the rollback left no secondary failures
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

impl Display for RollbackStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRequired => f.write_str("no rollback required"),
            Self::Clean => f.write_str("rolled back"),
            Self::Failed(errors) => write!(f, "rollback failed: {}", errors.join("; ")),
        }
    }
}

/// Where and why a submission failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Failure classification
    pub kind: FailureKind,
    /// Address of the failing step
    pub address: PathAddress,
    /// Name of the failing operation
    pub operation: String,
    /// Error text
    pub message: String,
    /// Index of the top-level operation that failed
    pub step_index: Option<usize>,
    /// What happened to the effects
    pub rollback: RollbackStatus,
}

impl Display for FailureReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation '{}' at {} failed ({}): {}; {}",
            self.operation, self.address, self.kind, self.message, self.rollback
        )
    }
}

/// Result of a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    /// Success or failure
    pub outcome: Outcome,
    /// Handler result; a list of per-operation results for composites
    pub result: ModelValue,
    /// Present exactly when the outcome is failed
    pub failure: Option<FailureReport>,
}

impl OperationResponse {
    /// Successful response carrying `result`
    #[must_use]
    pub fn success(result: ModelValue) -> Self {
        Self {
            outcome: Outcome::Success,
            result,
            failure: None,
        }
    }

    /// Failed response with an undefined result
    #[must_use]
    pub fn failed(report: FailureReport) -> Self {
        Self {
            outcome: Outcome::Failed,
            result: ModelValue::undefined(),
            failure: Some(report),
        }
    }

    /// Whether the submission committed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Kind of the failure, if any
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Human-readable failure, naming address, operation and rollback status
    #[must_use]
    pub fn failure_description(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    /// Model form of the response
    #[must_use]
    pub fn to_model(&self) -> ModelValue {
        let mut entries: Vec<(&str, ModelValue)> = vec![
            ("outcome", self.outcome.as_str().into()),
            ("result", self.result.clone()),
        ];
        if let Some(failure) = &self.failure {
            entries.push(("failure-description", failure.to_string().into()));
            entries.push(("rolled-back", (failure.rollback != RollbackStatus::NotRequired).into()));
        }
        entries.into_iter().collect()
    }
}
