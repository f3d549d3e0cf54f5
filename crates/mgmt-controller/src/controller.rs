//! Execution kernel
//!
//! [`ModelController`] owns the committed tree and drives each submission
//! through MODEL, RUNTIME and VERIFY, then commits or rolls back. It is the
//! single place where handler failures, panics, timeouts and cancellation
//! are turned into a failed [`OperationResponse`].

use crate::config::ControllerConfig;
use crate::context::{panic_message, OperationContext, Step};
use crate::error::OperationFailure;
use crate::journal::OperationJournal;
use crate::locks::{ContextId, HeldLocks, LockTable};
use crate::persistence::{ConfigurationPersister, NullPersister};
use crate::registry::HandlerRegistry;
use crate::resource::{Resource, ResourceTree};
use crate::response::{FailureReport, OperationResponse, RollbackStatus};
use crate::service::{InMemoryServiceRegistry, ServiceController};
use crate::stage::Stage;
use crate::submission::{self, CancelToken, Submission};
use futures::FutureExt;
use mgmt_model::{ModelValue, Operation, PathAddress, Request};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Where a failure is reported
struct FailedAt {
    address: PathAddress,
    operation: String,
    index: Option<usize>,
}

impl FailedAt {
    fn of(step: &Step) -> Self {
        Self {
            address: step.address().clone(),
            operation: step.operation.name.clone(),
            index: Some(step.slot),
        }
    }

    fn current(ctx: &OperationContext) -> Self {
        Self {
            address: ctx.current_address().clone(),
            operation: ctx.operation_name().to_string(),
            index: None,
        }
    }
}

/// Deadline and cancellation shared by every wait of one submission
#[derive(Clone, Copy)]
struct Limits<'a> {
    deadline: Instant,
    timeout: Duration,
    cancel: Option<&'a CancelToken>,
}

impl Limits<'_> {
    fn check(&self) -> Result<(), OperationFailure> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(OperationFailure::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(OperationFailure::Timeout(self.timeout));
        }
        Ok(())
    }

    /// Race `work` against the deadline and the cancel token
    async fn guard<T>(
        &self,
        work: impl Future<Output = Result<T, OperationFailure>>,
    ) -> Result<T, OperationFailure> {
        tokio::select! {
            biased;
            () = submission::cancelled(self.cancel) => Err(OperationFailure::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => Err(OperationFailure::Timeout(self.timeout)),
            result = work => result,
        }
    }
}

/// The management controller
pub struct ModelController {
    tree: Arc<ResourceTree>,
    registry: Arc<HandlerRegistry>,
    services: Arc<dyn ServiceController>,
    persister: Arc<dyn ConfigurationPersister>,
    locks: Arc<LockTable>,
    journal: Option<OperationJournal>,
    config: ControllerConfig,
}

impl ModelController {
    /// Controller over an empty root with in-memory services and no
    /// persistence
    #[must_use]
    pub fn new(registry: HandlerRegistry) -> Self {
        let config = ControllerConfig::default();
        Self {
            tree: Arc::new(ResourceTree::default()),
            registry: Arc::new(registry),
            services: Arc::new(InMemoryServiceRegistry::new()),
            persister: Arc::new(NullPersister),
            locks: Arc::new(LockTable::new()),
            journal: journal_for(&config),
            config,
        }
    }

    /// Start from `root` instead of an empty tree
    #[must_use]
    pub fn with_root(mut self, root: Resource) -> Self {
        self.tree = Arc::new(ResourceTree::new(root));
        self
    }

    /// Use `services` for RUNTIME work
    #[must_use]
    pub fn with_service_controller(mut self, services: Arc<dyn ServiceController>) -> Self {
        self.services = services;
        self
    }

    /// Store every committed tree through `persister`
    #[must_use]
    pub fn with_persister(mut self, persister: Arc<dyn ConfigurationPersister>) -> Self {
        self.persister = persister;
        self
    }

    /// Replace the configuration; rebuilds the journal
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.journal = journal_for(&config);
        self.config = config;
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Committed tree
    #[must_use]
    pub fn tree(&self) -> &Arc<ResourceTree> {
        &self.tree
    }

    /// Handler registry
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Submission journal, unless disabled
    #[must_use]
    pub fn journal(&self) -> Option<&OperationJournal> {
        self.journal.as_ref()
    }

    /// Committed resource at `address`
    #[must_use]
    pub fn read_resource(&self, address: &PathAddress) -> Option<Arc<Resource>> {
        self.tree.read(address)
    }

    /// Current committed root
    #[must_use]
    pub fn snapshot(&self) -> Arc<Resource> {
        self.tree.snapshot()
    }

    /// Run one operation with the configured deadline
    pub async fn execute(&self, operation: Operation) -> OperationResponse {
        self.submit(Submission::single(operation)).await
    }

    /// Run an atomic batch with the configured deadline
    pub async fn execute_composite(&self, operations: Vec<Operation>) -> OperationResponse {
        self.submit(Submission::composite(operations)).await
    }

    /// Run a submission to its outcome
    ///
    /// Never fails: every error becomes a failed response. Dropping the
    /// returned future before it resolves commits nothing. Runtime effects
    /// already applied are undone on a spawned task, which releases the
    /// submission's locks once the last rollback action has run.
    pub async fn submit(&self, submission: Submission) -> OperationResponse {
        let Submission {
            request,
            timeout,
            cancel,
        } = submission;
        let timeout = timeout.unwrap_or_else(|| self.config.operation_timeout());
        let limits = Limits {
            deadline: Instant::now() + timeout,
            timeout,
            cancel: cancel.as_ref(),
        };
        let composite = request.is_composite();
        let operations = match request {
            Request::Single(operation) => vec![operation],
            Request::Composite(operations) => operations,
        };

        let id = Uuid::new_v4();
        let span = match operations.as_slice() {
            [single] if !composite => tracing::info_span!(
                "submission",
                context = %id,
                operation = %single.name,
                address = %single.address,
            ),
            _ => tracing::info_span!(
                "submission",
                context = %id,
                operation = mgmt_model::COMPOSITE,
                steps = operations.len(),
            ),
        };

        let names: Vec<String> = operations.iter().map(|o| o.name.clone()).collect();
        let addresses: Vec<String> = operations.iter().map(|o| o.address.to_string()).collect();
        let started = std::time::Instant::now();
        let response = self
            .run(id, operations, composite, limits)
            .instrument(span)
            .await;

        metrics::counter!("mgmt_operations_total", "outcome" => response.outcome.as_str())
            .increment(1);
        metrics::histogram!("mgmt_operation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        if let Some(journal) = &self.journal {
            let outcome = match response.failure_kind() {
                None => response.outcome.as_str().to_string(),
                Some(kind) => format!("{}: {kind}", response.outcome.as_str()),
            };
            journal.record(id, names, addresses, outcome);
        }
        response
    }

    async fn run(
        &self,
        id: ContextId,
        operations: Vec<Operation>,
        composite: bool,
        limits: Limits<'_>,
    ) -> OperationResponse {
        let mut steps = Vec::with_capacity(operations.len());
        for (index, operation) in operations.into_iter().enumerate() {
            match self.registry.resolve(&operation.address, &operation.name) {
                Ok(resolved) => steps.push(Step::new(
                    operation,
                    resolved.handler,
                    resolved.affinity,
                    index,
                )),
                Err(failure) => {
                    let at = FailedAt {
                        address: operation.address,
                        operation: operation.name,
                        index: Some(index),
                    };
                    debug!(error = %failure, "unresolvable operation");
                    return failed(&failure, at, RollbackStatus::NotRequired);
                }
            }
        }

        let lock_targets: Vec<PathAddress> = steps
            .iter()
            .filter(|s| s.affinity.may_write())
            .map(|s| s.address().clone())
            .collect();
        let first = steps.first().map(FailedAt::of);
        let mut ctx = OperationContext::new(
            id,
            Arc::clone(&self.tree),
            Arc::clone(&self.registry),
            Arc::clone(&self.services),
            HeldLocks::new(Arc::clone(&self.locks), id),
            steps.len(),
        );
        for step in steps {
            ctx.enqueue(step);
        }
        let Some(first) = first else {
            return OperationResponse::success(ModelValue::new_list());
        };

        if let Err(failure) = limits.guard(ctx.locks_mut().acquire_all(lock_targets)).await {
            return self.fail(ctx, failure, first).await;
        }

        if let Err((failure, at)) = self.drive(&mut ctx, limits).await {
            return self.fail(ctx, failure, at).await;
        }

        let commit_at = FailedAt { index: None, ..first };
        let working = ctx.take_working();
        if !working.is_empty() {
            let tree = Arc::clone(&self.tree);
            let persister = Arc::clone(&self.persister);
            // store and swap run off the async workers; the context keeps
            // the task so a dropped submission can still settle it
            ctx.begin_commit(tokio::task::spawn_blocking(move || {
                tree.commit(|root| -> Result<(), OperationFailure> {
                    working.apply(root)?;
                    persister.store(root)?;
                    Ok(())
                })
            }));
            match ctx.finish_commit().await {
                Ok(generation) => info!(generation, steps = ctx.steps_run(), "committed"),
                Err(failure) => return self.fail(ctx, failure, commit_at).await,
            }
        }
        if let Err(e) = ctx.transition(Stage::Completed) {
            return self.fail(ctx, e.into(), commit_at).await;
        }

        let results = ctx.take_results();
        drop(ctx);
        if composite {
            OperationResponse::success(ModelValue::from(results))
        } else {
            let result = results.into_iter().next().unwrap_or_else(ModelValue::undefined);
            OperationResponse::success(result)
        }
    }

    /// MODEL, RUNTIME and VERIFY
    async fn drive(
        &self,
        ctx: &mut OperationContext,
        limits: Limits<'_>,
    ) -> Result<(), (OperationFailure, FailedAt)> {
        for stage in [Stage::Model, Stage::Runtime] {
            if ctx.stage() != stage {
                ctx.transition(stage).map_err(|e| (e.into(), FailedAt::current(ctx)))?;
            }
            while let Some(step) = ctx.next_step(stage) {
                let at = FailedAt::of(&step);
                self.run_step(ctx, step, limits)
                    .await
                    .map_err(|failure| (failure, at))?;
            }
        }
        ctx.transition(Stage::Verify)
            .map_err(|e| (e.into(), FailedAt::current(ctx)))?;
        ctx.verify().map_err(|failure| (failure, FailedAt::current(ctx)))
    }

    async fn run_step(
        &self,
        ctx: &mut OperationContext,
        step: Step,
        limits: Limits<'_>,
    ) -> Result<(), OperationFailure> {
        ctx.count_step(self.config.max_steps)?;
        limits.check()?;
        if step.stage == Stage::Model && step.affinity.may_write() {
            limits.guard(ctx.locks_mut().acquire(step.address())).await?;
        }
        debug!(
            stage = %step.stage,
            address = %step.address(),
            operation = %step.operation.name,
            "executing step"
        );

        let handler = Arc::clone(&step.handler);
        let operation = Arc::clone(&step.operation);
        ctx.begin_step(&step);
        let outcome = limits
            .guard(async {
                match AssertUnwindSafe(handler.execute(ctx, &operation))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(payload) => Err(OperationFailure::IllegalState(format!(
                        "handler panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                }
            })
            .await;
        ctx.finish_step(outcome)
    }

    /// Roll back and report
    async fn fail(
        &self,
        mut ctx: OperationContext,
        failure: OperationFailure,
        at: FailedAt,
    ) -> OperationResponse {
        warn!(
            address = %at.address,
            operation = %at.operation,
            kind = %failure.kind(),
            error = %failure,
            "operation failed, rolling back"
        );
        let had_effects = ctx.has_effects();
        if !ctx.stage().is_terminal() {
            if let Err(e) = ctx.transition(Stage::RolledBack) {
                debug!(error = %e, "rollback transition");
            }
        }
        let secondary = ctx.roll_back().await;
        drop(ctx);

        let rollback = if !secondary.is_empty() {
            RollbackStatus::Failed(secondary)
        } else if had_effects {
            RollbackStatus::Clean
        } else {
            RollbackStatus::NotRequired
        };
        if rollback != RollbackStatus::NotRequired {
            metrics::counter!("mgmt_rollbacks_total").increment(1);
        }
        failed(&failure, at, rollback)
    }
}

fn journal_for(config: &ControllerConfig) -> Option<OperationJournal> {
    config
        .journal_enabled
        .then(|| OperationJournal::new(config.journal_capacity))
}

fn failed(failure: &OperationFailure, at: FailedAt, rollback: RollbackStatus) -> OperationResponse {
    OperationResponse::failed(FailureReport {
        kind: failure.kind(),
        address: at.address,
        operation: at.operation,
        message: failure.to_string(),
        step_index: at.index,
        rollback,
    })
}
