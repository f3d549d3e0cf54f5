//! Step handler capability
//!
//! A handler is a stateless unit invoked once per step. It inspects
//! [`OperationContext::stage`], mutates the working model, schedules more
//! steps or registers rollback actions, and must call
//! [`OperationContext::complete_step`] exactly once before returning.

use crate::context::OperationContext;
use crate::error::OperationFailure;
use async_trait::async_trait;
use mgmt_model::Operation;
use std::fmt;
use std::sync::Arc;

/// Executes one step of an operation
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step
    ///
    /// # Errors
    /// Any [`OperationFailure`]; the kernel rolls the whole context back.
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), OperationFailure>;
}

/// Handler shared between the registry and queued steps
pub type SharedHandler = Arc<dyn StepHandler>;

/// Adapter for synchronous closures
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(&mut OperationContext, &Operation) -> Result<(), OperationFailure> + Send + Sync + 'static,
{
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), OperationFailure> {
        (self.f)(ctx, operation)
    }
}

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(f: F) -> SharedHandler
where
    F: Fn(&mut OperationContext, &Operation) -> Result<(), OperationFailure> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}
