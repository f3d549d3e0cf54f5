//! Management controller (mgmt-controller)
//!
//! Staged, rollback-capable operation kernel over an addressable resource
//! tree. A submission (one operation or an atomic composite batch) runs in a
//! single [`OperationContext`] through three stages:
//! 1. **MODEL**: handlers validate parameters and mutate working copies of
//!    the tree, possibly pushing more steps
//! 2. **RUNTIME**: handlers apply the change to live services and register
//!    compensating actions
//! 3. **VERIFY**: the kernel checks every step completed
//!
//! then commits the working copies atomically or rolls everything back.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mgmt_controller::prelude::*;
//!
//! let controller = ModelController::new(builtin_registry());
//! let op = Operation::new("/deployment=app.war".parse()?, "add");
//! let response = controller.execute(op).await;
//! assert!(response.is_success());
//! ```

pub mod attribute;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod journal;
pub mod locks;
pub mod persistence;
pub mod registry;
pub mod resource;
pub mod response;
pub mod service;
pub mod stage;
pub mod submission;

mod working;

pub use attribute::AttributeDefinition;
pub use config::{ConfigError, ControllerConfig};
pub use context::OperationContext;
pub use controller::ModelController;
pub use error::{FailureKind, OperationFailure};
pub use handler::{handler_fn, SharedHandler, StepHandler};
pub use handlers::{builtin_registry, register_builtin_handlers};
pub use journal::{JournalEntry, JournalError, OperationJournal};
pub use locks::{ContextId, HeldLocks, LockTable};
pub use persistence::{ConfigurationPersister, JsonFilePersister, NullPersister, PersistenceError};
pub use registry::{HandlerRegistry, ResolvedHandler};
pub use resource::{Resource, ResourceTree};
pub use response::{FailureReport, OperationResponse, Outcome, RollbackStatus};
pub use service::{InMemoryServiceRegistry, ServiceController, ServiceError, ServiceRecord};
pub use stage::{Stage, StageAffinity, StageError};
pub use submission::{cancellation, CancelHandle, CancelToken, Submission};

/// Common imports for handler authors and embedders
pub mod prelude {
    pub use crate::{
        builtin_registry, handler_fn, AttributeDefinition, ControllerConfig, FailureKind,
        HandlerRegistry, ModelController, OperationContext, OperationFailure, OperationResponse,
        Resource, RollbackStatus, ServiceController, Stage, StageAffinity, StepHandler,
        Submission,
    };
    pub use mgmt_model::{ModelType, ModelValue, Operation, PathAddress, Request};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
