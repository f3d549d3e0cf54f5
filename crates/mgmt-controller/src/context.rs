//! Operation context
//!
//! One [`OperationContext`] exists per submission. It owns the step queues,
//! the working copies of every subtree taken for update, the per-operation
//! result slots and the stack of rollback actions. Handlers see it through
//! the public methods below; the kernel drives it through the crate-private
//! ones.
//!
//! Resource addresses passed to context methods are relative to the address
//! of the step being executed. Operations handed to
//! [`OperationContext::add_step_for`] and [`OperationContext::push_operation`]
//! carry absolute addresses, like submitted requests.

use crate::error::OperationFailure;
use crate::handler::SharedHandler;
use crate::locks::{ContextId, HeldLocks};
use crate::registry::HandlerRegistry;
use crate::resource::{Resource, ResourceTree};
use crate::service::ServiceController;
use crate::stage::{validate_transition, Stage, StageAffinity, StageError};
use crate::working::WorkingTree;
use futures::future::BoxFuture;
use futures::FutureExt;
use mgmt_model::{ModelValue, Operation, PathAddress};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;

type RollbackFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), OperationFailure>> + Send>;

/// Commit running on the blocking pool; yields the new generation
pub(crate) type CommitTask = JoinHandle<Result<u64, OperationFailure>>;

struct RollbackAction {
    description: String,
    action: RollbackFn,
}

/// A queued unit of handler execution
pub(crate) struct Step {
    pub(crate) operation: Arc<Operation>,
    pub(crate) handler: SharedHandler,
    pub(crate) affinity: StageAffinity,
    pub(crate) stage: Stage,
    pub(crate) slot: usize,
}

impl Step {
    pub(crate) fn new(
        operation: Operation,
        handler: SharedHandler,
        affinity: StageAffinity,
        slot: usize,
    ) -> Self {
        Self {
            operation: Arc::new(operation),
            handler,
            affinity,
            stage: Stage::Model,
            slot,
        }
    }

    pub(crate) fn address(&self) -> &PathAddress {
        &self.operation.address
    }
}

struct ActiveStep {
    affinity: StageAffinity,
    completed: bool,
    misuse: Option<String>,
    pushed: Vec<Step>,
}

/// Mutable state of one submission
pub struct OperationContext {
    id: ContextId,
    stage: Stage,
    tree: Arc<ResourceTree>,
    registry: Arc<HandlerRegistry>,
    services: Arc<dyn ServiceController>,
    locks: HeldLocks,
    working: WorkingTree,
    /// Working changes were handed to the commit
    committing: bool,
    commit: Option<CommitTask>,
    removed: BTreeMap<PathAddress, Resource>,
    model_queue: VecDeque<Step>,
    runtime_queue: VecDeque<Step>,
    current: Arc<Operation>,
    current_slot: usize,
    active: Option<ActiveStep>,
    results: Vec<ModelValue>,
    rollbacks: Vec<RollbackAction>,
    steps_run: usize,
}

impl OperationContext {
    pub(crate) fn new(
        id: ContextId,
        tree: Arc<ResourceTree>,
        registry: Arc<HandlerRegistry>,
        services: Arc<dyn ServiceController>,
        locks: HeldLocks,
        slots: usize,
    ) -> Self {
        Self {
            id,
            stage: Stage::Model,
            tree,
            registry,
            services,
            locks,
            working: WorkingTree::default(),
            committing: false,
            commit: None,
            removed: BTreeMap::new(),
            model_queue: VecDeque::new(),
            runtime_queue: VecDeque::new(),
            current: Arc::new(Operation::new(PathAddress::root(), "")),
            current_slot: 0,
            active: None,
            results: vec![ModelValue::undefined(); slots.max(1)],
            rollbacks: Vec::new(),
            steps_run: 0,
        }
    }

    /// Identity shared with the lock table
    #[inline]
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Stage currently executing
    #[inline]
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Absolute address of the step being executed
    #[inline]
    #[must_use]
    pub fn current_address(&self) -> &PathAddress {
        &self.current.address
    }

    /// Name of the operation being executed
    #[inline]
    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.current.name
    }

    /// Registry, for handlers that resolve further operations
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Live service collaborator
    #[must_use]
    pub fn service_controller(&self) -> Arc<dyn ServiceController> {
        Arc::clone(&self.services)
    }

    fn absolute(&self, relative: &PathAddress) -> PathAddress {
        self.current.address.append(relative)
    }

    /// Snapshot of a resource as this context currently sees it
    ///
    /// # Errors
    /// [`OperationFailure::ResourceNotFound`].
    pub fn read_resource(&self, relative: &PathAddress) -> Result<Arc<Resource>, OperationFailure> {
        let address = self.absolute(relative);
        self.working
            .read(&self.tree.snapshot(), &address)
            .ok_or(OperationFailure::ResourceNotFound(address))
    }

    /// Whether a resource exists, as this context sees it
    #[must_use]
    pub fn resource_exists(&self, relative: &PathAddress) -> bool {
        self.working
            .exists(&self.tree.snapshot(), &self.absolute(relative))
    }

    fn check_mutation(&self, what: &str) -> Result<(), OperationFailure> {
        if self.stage != Stage::Model {
            return Err(OperationFailure::illegal_state(format!(
                "{what} is only legal during {}, not {}",
                Stage::Model,
                self.stage
            )));
        }
        match &self.active {
            Some(active) if active.affinity.may_write() => Ok(()),
            Some(_) => Err(OperationFailure::illegal_state(format!(
                "{what} from a read-only handler"
            ))),
            None => Err(OperationFailure::illegal_state(format!("{what} outside a step"))),
        }
    }

    /// Take or confirm the lock covering `address`; returns its root
    fn lock_root(&mut self, address: &PathAddress) -> Result<PathAddress, OperationFailure> {
        self.locks.try_acquire(address)?;
        Ok(self
            .locks
            .root_for(address)
            .cloned()
            .unwrap_or_else(|| address.clone()))
    }

    /// Writable working copy of a resource
    ///
    /// Repeated calls for the same address return the same working copy.
    ///
    /// # Errors
    /// ILLEGAL-STATE outside MODEL or from a read-only handler,
    /// [`OperationFailure::ResourceNotFound`], or LOCK-ORDER when another
    /// context holds the subtree.
    pub fn read_resource_for_update(
        &mut self,
        relative: &PathAddress,
    ) -> Result<&mut Resource, OperationFailure> {
        self.check_mutation("read_resource_for_update")?;
        let address = self.absolute(relative);
        let root = self.lock_root(&address)?;
        let committed = self.tree.snapshot();
        self.working.for_update(&committed, &root, &address)
    }

    /// Create an empty resource
    ///
    /// # Errors
    /// [`OperationFailure::AlreadyExists`], or
    /// [`OperationFailure::ResourceNotFound`] when the parent is missing.
    pub fn create_resource(
        &mut self,
        relative: &PathAddress,
    ) -> Result<&mut Resource, OperationFailure> {
        self.check_mutation("create_resource")?;
        let address = self.absolute(relative);
        let root = self.lock_root(&address)?;
        let committed = self.tree.snapshot();
        self.working.create(&committed, &root, &address)
    }

    /// Create child `key=name` under `parent`
    ///
    /// # Errors
    /// Same as [`create_resource`](Self::create_resource).
    pub fn add_child(
        &mut self,
        parent: &PathAddress,
        key: &str,
        name: &str,
    ) -> Result<&mut Resource, OperationFailure> {
        self.create_resource(&parent.child(key, name))
    }

    /// Detach a resource and its subtree
    ///
    /// The detached data stays available through
    /// [`removed_resource`](Self::removed_resource) until the context ends.
    ///
    /// # Errors
    /// [`OperationFailure::ResourceNotFound`], ILLEGAL-STATE for the root.
    pub fn remove_resource(&mut self, relative: &PathAddress) -> Result<Resource, OperationFailure> {
        self.check_mutation("remove_resource")?;
        let address = self.absolute(relative);
        let root = self.lock_root(&address)?;
        let committed = self.tree.snapshot();
        let detached = self.working.remove(&committed, &root, &address)?;
        self.removed.insert(address, detached.clone());
        Ok(detached)
    }

    /// Resource this context removed, if any
    #[must_use]
    pub fn removed_resource(&self, relative: &PathAddress) -> Option<&Resource> {
        self.removed.get(&self.absolute(relative))
    }

    /// Result slot of the operation this step belongs to
    pub fn result_mut(&mut self) -> &mut ModelValue {
        &mut self.results[self.current_slot]
    }

    /// Replace the result of the current operation
    pub fn set_result(&mut self, value: impl Into<ModelValue>) {
        *self.result_mut() = value.into();
    }

    /// Signal that this step is done for the current stage
    ///
    /// # Errors
    /// ILLEGAL-STATE on a second call; the kernel also fails the context.
    pub fn complete_step(&mut self) -> Result<(), OperationFailure> {
        match &mut self.active {
            Some(active) if !active.completed => {
                active.completed = true;
                Ok(())
            }
            Some(active) => {
                let message = format!(
                    "step for '{}' at {} completed more than once",
                    self.current.name, self.current.address
                );
                active.misuse = Some(message.clone());
                Err(OperationFailure::IllegalState(message))
            }
            None => Err(OperationFailure::illegal_state("complete_step outside a step")),
        }
    }

    /// Queue `handler` for this step's operation
    ///
    /// # Errors
    /// See [`add_step_for`](Self::add_step_for).
    pub fn add_step(&mut self, handler: SharedHandler, stage: Stage) -> Result<(), OperationFailure> {
        let operation = Operation::clone(&self.current);
        self.push_step(operation, handler, None, stage)
    }

    /// Queue `handler` for `operation`
    ///
    /// Steps for the current stage run next, most recently added first;
    /// RUNTIME steps added during MODEL run in the order they were added.
    ///
    /// # Errors
    /// ILLEGAL-STATE when the stage is not reachable from here, or when a
    /// handler without runtime affinity schedules RUNTIME work.
    pub fn add_step_for(
        &mut self,
        operation: Operation,
        handler: SharedHandler,
        stage: Stage,
    ) -> Result<(), OperationFailure> {
        self.push_step(operation, handler, None, stage)
    }

    /// Resolve `operation` through the registry and run it next in MODEL
    ///
    /// # Errors
    /// NOT-FOUND when no handler matches; ILLEGAL-STATE outside MODEL.
    pub fn push_operation(&mut self, operation: Operation) -> Result<(), OperationFailure> {
        let resolved = self.registry.resolve(&operation.address, &operation.name)?;
        self.push_step(operation, resolved.handler, Some(resolved.affinity), Stage::Model)
    }

    fn push_step(
        &mut self,
        operation: Operation,
        handler: SharedHandler,
        affinity: Option<StageAffinity>,
        stage: Stage,
    ) -> Result<(), OperationFailure> {
        let current_stage = self.stage;
        let slot = self.current_slot;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| OperationFailure::illegal_state("steps can only be added by a step"))?;
        match stage {
            Stage::Model if current_stage == Stage::Model => {}
            Stage::Runtime if current_stage.runs_handlers() => {
                if !active.affinity.may_schedule_runtime() {
                    return Err(OperationFailure::illegal_state(format!(
                        "handler for '{}' is not registered for {} work",
                        operation.name,
                        Stage::Runtime
                    )));
                }
            }
            _ => {
                return Err(OperationFailure::illegal_state(format!(
                    "cannot add a {stage} step during {current_stage}"
                )))
            }
        }
        active.pushed.push(Step {
            operation: Arc::new(operation),
            handler,
            affinity: affinity.unwrap_or(active.affinity),
            stage,
            slot,
        });
        Ok(())
    }

    /// Register a compensating action, run in reverse registration order on
    /// failure
    pub fn register_rollback<F, Fut>(&mut self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), OperationFailure>> + Send + 'static,
    {
        self.rollbacks.push(RollbackAction {
            description: description.into(),
            action: Box::new(move || action().boxed()),
        });
    }

    // ----- kernel side -----

    pub(crate) fn enqueue(&mut self, step: Step) {
        self.model_queue.push_back(step);
    }

    pub(crate) fn next_step(&mut self, stage: Stage) -> Option<Step> {
        match stage {
            Stage::Model => self.model_queue.pop_front(),
            Stage::Runtime => self.runtime_queue.pop_front(),
            _ => None,
        }
    }

    pub(crate) fn locks_mut(&mut self) -> &mut HeldLocks {
        &mut self.locks
    }

    pub(crate) fn transition(&mut self, to: Stage) -> Result<(), StageError> {
        validate_transition(self.stage, to)?;
        tracing::debug!(context = %self.id, from = %self.stage, %to, "stage transition");
        self.stage = to;
        Ok(())
    }

    /// Count a step against `limit`
    pub(crate) fn count_step(&mut self, limit: usize) -> Result<(), OperationFailure> {
        self.steps_run += 1;
        if self.steps_run > limit {
            return Err(OperationFailure::illegal_state(format!(
                "step limit of {limit} exceeded"
            )));
        }
        Ok(())
    }

    pub(crate) fn steps_run(&self) -> usize {
        self.steps_run
    }

    pub(crate) fn begin_step(&mut self, step: &Step) {
        self.current = Arc::clone(&step.operation);
        self.current_slot = step.slot;
        self.active = Some(ActiveStep {
            affinity: step.affinity,
            completed: false,
            misuse: None,
            pushed: Vec::new(),
        });
    }

    /// Close the active step and queue what it added
    pub(crate) fn finish_step(
        &mut self,
        outcome: Result<(), OperationFailure>,
    ) -> Result<(), OperationFailure> {
        let active = self
            .active
            .take()
            .ok_or_else(|| OperationFailure::illegal_state("no step in progress"))?;
        outcome?;
        if let Some(misuse) = active.misuse {
            return Err(OperationFailure::IllegalState(misuse));
        }
        if !active.completed {
            return Err(OperationFailure::illegal_state(format!(
                "handler for '{}' at {} returned without completing its step",
                self.current.name, self.current.address
            )));
        }
        let mut current_stage = Vec::new();
        for step in active.pushed {
            if step.stage == self.stage {
                current_stage.push(step);
            } else {
                self.runtime_queue.push_back(step);
            }
        }
        let queue = match self.stage {
            Stage::Runtime => &mut self.runtime_queue,
            _ => &mut self.model_queue,
        };
        for step in current_stage {
            queue.push_front(step);
        }
        Ok(())
    }

    /// Everything queued ran and no step is open
    pub(crate) fn verify(&self) -> Result<(), OperationFailure> {
        if self.active.is_some() {
            return Err(OperationFailure::illegal_state("a step is still open"));
        }
        let pending = self.model_queue.len() + self.runtime_queue.len();
        if pending > 0 {
            return Err(OperationFailure::illegal_state(format!(
                "{pending} steps never ran"
            )));
        }
        Ok(())
    }

    /// Whether anything would need undoing
    pub(crate) fn has_effects(&self) -> bool {
        self.committing
            || !self.working.is_empty()
            || !self.rollbacks.is_empty()
            || !self.removed.is_empty()
    }

    pub(crate) fn take_working(&mut self) -> WorkingTree {
        self.committing = !self.working.is_empty();
        mem::take(&mut self.working)
    }

    /// Track a commit started from [`take_working`](Self::take_working)
    pub(crate) fn begin_commit(&mut self, task: CommitTask) {
        self.committing = true;
        self.commit = Some(task);
    }

    /// Wait for the commit begun by [`begin_commit`](Self::begin_commit)
    pub(crate) async fn finish_commit(&mut self) -> Result<u64, OperationFailure> {
        let Some(task) = self.commit.as_mut() else {
            return Err(OperationFailure::illegal_state("no commit in progress"));
        };
        let joined = task.await;
        self.commit = None;
        joined.map_err(|e| OperationFailure::illegal_state(format!("commit task failed: {e}")))?
    }

    pub(crate) fn take_results(&mut self) -> Vec<ModelValue> {
        mem::take(&mut self.results)
    }

    /// Discard model changes and run every rollback action, newest first
    ///
    /// Returns the descriptions of actions that failed.
    pub(crate) async fn roll_back(&mut self) -> Vec<String> {
        self.working = WorkingTree::default();
        self.removed.clear();
        self.model_queue.clear();
        self.runtime_queue.clear();
        let mut failures = Vec::new();
        while let Some(action) = self.rollbacks.pop() {
            if let Some(failure) = action.run(self.id).await {
                failures.push(failure);
            }
        }
        failures
    }
}

impl RollbackAction {
    /// Run the action, describing it if it failed or panicked
    async fn run(self, context: ContextId) -> Option<String> {
        let Self {
            description,
            action,
        } = self;
        let outcome = AssertUnwindSafe(async move { action().await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(%context, %description, "rollback action ran");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(%context, %description, error = %e, "rollback action failed");
                Some(format!("{description}: {e}"))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(%context, %description, panic = %message, "rollback action panicked");
                Some(format!("{description}: panicked: {message}"))
            }
        }
    }
}

/// A context dropped before completing still owes its rollback actions.
/// They run newest first on a spawned task that keeps the context's locks
/// until the last action finishes. A commit already in flight is awaited
/// first; if it lands, nothing is rolled back.
impl Drop for OperationContext {
    fn drop(&mut self) {
        if self.stage == Stage::Completed {
            return;
        }
        let commit = self.commit.take();
        if self.rollbacks.is_empty() && commit.is_none() {
            return;
        }
        let mut pending = mem::take(&mut self.rollbacks);
        let locks = self.locks.detach();
        let context = self.id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                %context,
                pending = pending.len(),
                "context dropped outside a runtime, rollback actions lost"
            );
            return;
        };
        tracing::warn!(
            %context,
            stage = %self.stage,
            pending = pending.len(),
            "context dropped before completion, rolling back"
        );
        runtime.spawn(async move {
            if let Some(commit) = commit {
                if let Ok(Ok(generation)) = commit.await {
                    tracing::info!(%context, generation, "commit landed after its submission was dropped");
                    drop(locks);
                    return;
                }
            }
            let mut failed = 0_usize;
            while let Some(action) = pending.pop() {
                if action.run(context).await.is_some() {
                    failed += 1;
                }
            }
            drop(locks);
            tracing::info!(%context, failed, "detached rollback finished");
        });
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
