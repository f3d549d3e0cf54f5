//! Testing utilities for the management controller workspace
//!
//! Shared fixtures, scripted handlers and a recording service controller.

#![allow(missing_docs)]

use async_trait::async_trait;
use mgmt_controller::handlers::{AddStepHandler, RemoveStepHandler, ADD, REMOVE};
use mgmt_controller::{
    builtin_registry, handler_fn, HandlerRegistry, InMemoryServiceRegistry, ModelController,
    OperationContext, OperationFailure, Resource, ServiceController, ServiceError, SharedHandler,
    Stage, StageAffinity, StepHandler,
};
use mgmt_model::{ModelValue, Operation, PathAddress};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn addr(text: &str) -> PathAddress {
    text.parse().unwrap()
}

pub fn op(address: &str, name: &str) -> Operation {
    Operation::new(addr(address), name)
}

// ---------------------------------------------------------------------------
// Service controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Installed(String),
    Removed(String),
    InstallFailed(String),
    RemoveFailed(String),
}

/// In-memory services that log every call and fail on request
#[derive(Debug, Default)]
pub struct RecordingServiceController {
    inner: InMemoryServiceRegistry,
    events: Mutex<Vec<ServiceEvent>>,
    failing_installs: Mutex<HashSet<String>>,
    failing_removes: Mutex<HashSet<String>>,
}

impl RecordingServiceController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install without recording an event
    pub async fn preinstall(&self, name: &str) {
        self.inner.install(name, ModelValue::new_object()).await.unwrap();
    }

    pub fn fail_install(&self, name: &str) {
        self.failing_installs.lock().insert(name.to_string());
    }

    pub fn fail_remove(&self, name: &str) {
        self.failing_removes.lock().insert(name.to_string());
    }

    pub fn events(&self) -> Vec<ServiceEvent> {
        self.events.lock().clone()
    }

    pub fn installed(&self) -> Vec<String> {
        self.inner.installed_names()
    }
}

#[async_trait]
impl ServiceController for RecordingServiceController {
    async fn install(&self, name: &str, config: ModelValue) -> Result<(), ServiceError> {
        if self.failing_installs.lock().contains(name) {
            self.events.lock().push(ServiceEvent::InstallFailed(name.to_string()));
            return Err(ServiceError::Failed {
                name: name.to_string(),
                reason: "scripted install failure".to_string(),
            });
        }
        self.inner.install(name, config).await?;
        self.events.lock().push(ServiceEvent::Installed(name.to_string()));
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        if self.failing_removes.lock().contains(name) {
            self.events.lock().push(ServiceEvent::RemoveFailed(name.to_string()));
            return Err(ServiceError::Failed {
                name: name.to_string(),
                reason: "scripted remove failure".to_string(),
            });
        }
        self.inner.remove(name).await?;
        self.events.lock().push(ServiceEvent::Removed(name.to_string()));
        Ok(())
    }

    async fn is_installed(&self, name: &str) -> bool {
        self.inner.is_installed(name).await
    }
}

// ---------------------------------------------------------------------------
// Scripted handlers
// ---------------------------------------------------------------------------

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// MODEL schedules a RUNTIME step that logs `label` and registers an undo
/// logging `undo <label>`; with `fail` the RUNTIME step fails before
/// registering anything
pub fn runtime_effect(log: &Log, label: &str, fail: bool) -> SharedHandler {
    let log = Arc::clone(log);
    let label = label.to_string();
    handler_fn(move |ctx, _| {
        let log = Arc::clone(&log);
        let label = label.clone();
        ctx.add_step(
            handler_fn(move |ctx, _| {
                log.lock().push(label.clone());
                if fail {
                    return Err(OperationFailure::runtime(format!("{label} failed")));
                }
                let undo_log = Arc::clone(&log);
                let undo = format!("undo {label}");
                ctx.register_rollback(undo.clone(), move || async move {
                    undo_log.lock().push(undo);
                    Ok::<(), OperationFailure>(())
                });
                ctx.complete_step()
            }),
            Stage::Runtime,
        )?;
        ctx.complete_step()
    })
}

/// Fails with a RUNTIME-FAILURE
pub fn failing(message: &str) -> SharedHandler {
    let message = message.to_string();
    handler_fn(move |_, _| Err(OperationFailure::runtime(message.clone())))
}

/// Panics
pub fn panicking() -> SharedHandler {
    handler_fn(|_, _| panic!("handler exploded"))
}

/// Returns without completing its step
pub fn never_completes() -> SharedHandler {
    handler_fn(|_, _| Ok(()))
}

/// Completes twice, ignoring the error of the second call
pub fn completes_twice() -> SharedHandler {
    handler_fn(|ctx, _| {
        ctx.complete_step()?;
        let _ = ctx.complete_step();
        Ok(())
    })
}

/// Sets attribute `touched` on its resource, then sleeps
#[derive(Debug, Clone, Copy)]
pub struct Sleep(pub Duration);

#[async_trait]
impl StepHandler for Sleep {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
    ) -> Result<(), OperationFailure> {
        ctx.read_resource_for_update(&PathAddress::root())?
            .model_mut()
            .set("touched", true)?;
        tokio::time::sleep(self.0).await;
        ctx.complete_step()
    }
}

/// Writes `value` to its resource, signals `entered`, then waits for
/// `release`; holds the resource's lock meanwhile
#[derive(Debug, Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepHandler for Gate {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), OperationFailure> {
        ctx.read_resource_for_update(&PathAddress::root())?
            .model_mut()
            .set("value", operation.param("value").clone())?;
        self.entered.notify_one();
        self.release.notified().await;
        ctx.complete_step()
    }
}

/// MODEL schedules a RUNTIME step that signals `entered`, then waits for
/// `release`; touches no model
#[derive(Debug, Clone, Default)]
pub struct RuntimeGate(pub Gate);

#[async_trait]
impl StepHandler for RuntimeGate {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
    ) -> Result<(), OperationFailure> {
        if ctx.stage() == Stage::Model {
            ctx.add_step(Arc::new(self.clone()), Stage::Runtime)?;
        } else {
            self.0.entered.notify_one();
            self.0.release.notified().await;
        }
        ctx.complete_step()
    }
}

/// Writes `value`, logging `label` when it runs
pub fn logged_write(log: &Log, label: &str) -> SharedHandler {
    let log = Arc::clone(log);
    let label = label.to_string();
    handler_fn(move |ctx, operation| {
        log.lock().push(label.clone());
        ctx.read_resource_for_update(&PathAddress::root())?
            .model_mut()
            .set("value", operation.param("value").clone())?;
        ctx.complete_step()
    })
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn node(model: serde_json::Value) -> Resource {
    Resource::new(ModelValue::from(model))
}

/// ```text
/// /
/// ├── subsystem=foo            {"mode": "default"}
/// │   └── deployment=bar       {"enabled": true}
/// ├── subsystem=web            {"port": 8080}
/// ├── deployment=app.war       {"runtime-name": "app.war", "enabled": true}
/// └── server-group=main-group  {"profile": "default"}
///     └── deployment=app.war   {"enabled": true}
/// ```
pub fn fixture_tree() -> Resource {
    let mut foo = node(json!({"mode": "default"}));
    foo.set_child("deployment", "bar", Arc::new(node(json!({"enabled": true}))));

    let mut group = node(json!({"profile": "default"}));
    group.set_child("deployment", "app.war", Arc::new(node(json!({"enabled": true}))));

    let mut root = node(json!({"name": "test-host"}));
    root.set_child("subsystem", "foo", Arc::new(foo));
    root.set_child("subsystem", "web", Arc::new(node(json!({"port": 8080}))));
    root.set_child(
        "deployment",
        "app.war",
        Arc::new(node(json!({"runtime-name": "app.war", "enabled": true}))),
    );
    root.set_child("server-group", "main-group", Arc::new(group));
    root
}

/// Built-in handlers plus add/remove for subsystems and their children
pub fn test_registry() -> HandlerRegistry {
    let mut registry = builtin_registry();
    registry
        .register(
            addr("/subsystem=*"),
            ADD,
            StageAffinity::Runtime,
            Arc::new(AddStepHandler::new(Vec::new()).with_service()),
        )
        .register(
            addr("/subsystem=*"),
            REMOVE,
            StageAffinity::Runtime,
            Arc::new(RemoveStepHandler::new().with_service()),
        )
        .register(
            addr("/subsystem=*/deployment=*"),
            ADD,
            StageAffinity::Model,
            Arc::new(AddStepHandler::new(Vec::new())),
        );
    registry
}

/// Controller over [`fixture_tree`] with [`test_registry`] and recording
/// services
pub fn test_controller() -> (ModelController, Arc<RecordingServiceController>) {
    controller_with(test_registry())
}

pub fn controller_with(
    registry: HandlerRegistry,
) -> (ModelController, Arc<RecordingServiceController>) {
    let services = RecordingServiceController::new();
    let controller = ModelController::new(registry)
        .with_root(fixture_tree())
        .with_service_controller(Arc::clone(&services) as Arc<dyn ServiceController>);
    (controller, services)
}
