//! Error types for the operation kernel
//!
//! Every way a submission can fail is an [`OperationFailure`]. Handlers
//! return it, the kernel converts caught panics, timeouts and cancellation
//! into it, and [`FailureKind`] classifies it for the response.

use crate::persistence::PersistenceError;
use crate::service::ServiceError;
use crate::stage::StageError;
use mgmt_model::{AddressError, ModelError, PathAddress};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Failure raised while executing a submission
#[derive(Debug, thiserror::Error)]
pub enum OperationFailure {
    /// Bad parameter shape or value
    #[error("validation failed: {0}")]
    Validation(String),

    /// No resource at the address
    #[error("resource not found: {0}")]
    ResourceNotFound(PathAddress),

    /// No handler registered for the operation at the address
    #[error("no handler for operation '{operation}' at {address}")]
    HandlerNotFound {
        /// Target address
        address: PathAddress,
        /// Operation name
        operation: String,
    },

    /// Child of that type and name already present
    #[error("resource already exists: {0}")]
    AlreadyExists(PathAddress),

    /// Kernel contract misuse
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// External runtime effect failed
    #[error("runtime failure: {0}")]
    Runtime(String),

    /// Lock could only be taken out of address order
    #[error("lock order violation: cannot acquire {requested} while holding {held}")]
    LockOrder {
        /// Address that was busy
        requested: PathAddress,
        /// Highest address already held
        held: PathAddress,
    },

    /// Submission deadline exceeded
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Submission cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// Model value misuse
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Malformed address
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Stage machine misuse
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Service collaborator failure
    #[error("service failure: {0}")]
    Service(#[from] ServiceError),

    /// Persistence hook failure
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}

impl OperationFailure {
    /// VALIDATION with a message
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// ILLEGAL-STATE with a message
    #[inline]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// RUNTIME-FAILURE with a message
    #[inline]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Taxonomy entry of this failure
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) | Self::Address(_) => FailureKind::Validation,
            Self::Model(ModelError::Protected) => FailureKind::IllegalState,
            Self::Model(_) => FailureKind::Validation,
            Self::ResourceNotFound(_) | Self::HandlerNotFound { .. } => FailureKind::NotFound,
            Self::AlreadyExists(_) => FailureKind::AlreadyExists,
            Self::IllegalState(_) | Self::Stage(_) => FailureKind::IllegalState,
            Self::Runtime(_) | Self::Service(_) | Self::Persistence(_) => {
                FailureKind::RuntimeFailure
            }
            Self::LockOrder { .. } => FailureKind::LockOrder,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Failure classification reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Bad or missing parameters
    Validation,
    /// Addressed resource or operation is unknown
    NotFound,
    /// Child already present
    AlreadyExists,
    /// API misuse or a caught panic
    IllegalState,
    /// Live runtime or persistence failure
    RuntimeFailure,
    /// Busy lock below an address already held
    LockOrder,
    /// Deadline passed
    Timeout,
    /// Caller cancelled
    Cancelled,
}

impl FailureKind {
    /// Kebab-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::IllegalState => "illegal-state",
            Self::RuntimeFailure => "runtime-failure",
            Self::LockOrder => "lock-order",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_write_is_illegal_state() {
        let failure = OperationFailure::from(ModelError::Protected);
        assert_eq!(failure.kind(), FailureKind::IllegalState);
    }

    #[test]
    fn type_mismatch_is_validation() {
        let failure = OperationFailure::from(ModelError::TypeMismatch {
            expected: mgmt_model::ModelType::Object,
            actual: mgmt_model::ModelType::String,
        });
        assert_eq!(failure.kind(), FailureKind::Validation);
    }

    #[test]
    fn rejected_store_is_runtime_failure() {
        let rejected = OperationFailure::from(PersistenceError::Rejected("disk full".into()));
        assert_eq!(rejected.kind(), FailureKind::RuntimeFailure);
        assert_eq!(OperationFailure::Cancelled.kind(), FailureKind::Cancelled);
    }

    #[test]
    fn kinds_render_kebab_case() {
        assert_eq!(FailureKind::AlreadyExists.to_string(), "already-exists");
        assert_eq!(
            serde_json::to_string(&FailureKind::LockOrder).unwrap(),
            "\"lock-order\""
        );
    }
}
