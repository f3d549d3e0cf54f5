//! Deployment handlers
//!
//! `deploy` and `undeploy` flip the `enabled` attribute of a deployment.
//! Standalone deployments (`/deployment=*`) also start or stop the
//! deployment service during RUNTIME; server-group deployments only record
//! the intent in the model.

use crate::attribute::AttributeDefinition;
use crate::context::OperationContext;
use crate::error::OperationFailure;
use crate::handler::StepHandler;
use crate::handlers::add_remove::{
    AddStepHandler, InstallService, RemoveService, RemoveStepHandler, ADD, REMOVE,
};
use crate::registry::HandlerRegistry;
use crate::stage::{Stage, StageAffinity};
use async_trait::async_trait;
use mgmt_model::{ModelType, ModelValue, Operation, PathAddress, WILDCARD};
use std::sync::Arc;

/// Name of the deploy operation
pub const DEPLOY: &str = "deploy";
/// Name of the undeploy operation
pub const UNDEPLOY: &str = "undeploy";
/// Attribute toggled by deploy and undeploy
pub const ENABLED: &str = "enabled";

/// Attributes of a deployment resource
#[must_use]
pub fn deployment_attributes() -> Vec<AttributeDefinition> {
    vec![
        AttributeDefinition::new("runtime-name", ModelType::String),
        AttributeDefinition::new(ENABLED, ModelType::Boolean).with_default(false),
    ]
}

/// Sets `enabled`; returns the model and whether the flag changed
fn set_enabled(
    ctx: &mut OperationContext,
    enabled: bool,
) -> Result<(ModelValue, bool), OperationFailure> {
    let resource = ctx.read_resource_for_update(&PathAddress::root())?;
    let model = resource.model_mut();
    let was = model.get(ENABLED)?;
    let changed = !was.is_defined() || was.as_bool()? != enabled;
    model.set(ENABLED, enabled)?;
    Ok((model.clone(), changed))
}

/// `deploy`
#[derive(Debug, Default, Clone, Copy)]
pub struct DeployHandler {
    runtime: bool,
}

impl DeployHandler {
    /// Model-only: the deployment is started elsewhere
    #[must_use]
    pub fn model_only() -> Self {
        Self { runtime: false }
    }

    /// Also start the deployment service
    #[must_use]
    pub fn with_runtime() -> Self {
        Self { runtime: true }
    }
}

#[async_trait]
impl StepHandler for DeployHandler {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
    ) -> Result<(), OperationFailure> {
        let (config, changed) = set_enabled(ctx, true)?;
        if self.runtime && changed {
            ctx.add_step(Arc::new(InstallService { config }), Stage::Runtime)?;
        }
        ctx.complete_step()
    }
}

/// `undeploy`
#[derive(Debug, Default, Clone, Copy)]
pub struct UndeployHandler {
    runtime: bool,
}

impl UndeployHandler {
    /// Variant that only flips the attribute, for server-group deployments
    #[must_use]
    pub fn model_only() -> Self {
        Self { runtime: false }
    }

    /// Also stop the deployment service
    #[must_use]
    pub fn with_runtime() -> Self {
        Self { runtime: true }
    }
}

#[async_trait]
impl StepHandler for UndeployHandler {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
    ) -> Result<(), OperationFailure> {
        let (mut config, changed) = set_enabled(ctx, false)?;
        if self.runtime && changed {
            // a reinstall on rollback restarts it enabled
            config.set(ENABLED, true)?;
            ctx.add_step(Arc::new(RemoveService { config }), Stage::Runtime)?;
        }
        ctx.complete_step()
    }
}

/// Register deployment and server-group handlers
///
/// `/deployment=*` gets add, remove, deploy and undeploy with runtime
/// effects. `/server-group=*` gets add and remove, and its deployments get
/// model-only variants.
pub fn register_deployment_handlers(registry: &mut HandlerRegistry) {
    let deployment = PathAddress::root().child("deployment", WILDCARD);
    let server_group = PathAddress::root().child("server-group", WILDCARD);
    let group_deployment = server_group.child("deployment", WILDCARD);

    registry
        .register(
            deployment.clone(),
            ADD,
            StageAffinity::Model,
            Arc::new(AddStepHandler::new(deployment_attributes())),
        )
        .register(
            deployment.clone(),
            REMOVE,
            StageAffinity::Runtime,
            Arc::new(RemoveStepHandler::new().with_service()),
        )
        .register(
            deployment.clone(),
            DEPLOY,
            StageAffinity::Runtime,
            Arc::new(DeployHandler::with_runtime()),
        )
        .register(
            deployment,
            UNDEPLOY,
            StageAffinity::Runtime,
            Arc::new(UndeployHandler::with_runtime()),
        )
        .register(
            server_group.clone(),
            ADD,
            StageAffinity::Model,
            Arc::new(AddStepHandler::new(vec![AttributeDefinition::new(
                "profile",
                ModelType::String,
            )
            .required()])),
        )
        .register(
            server_group,
            REMOVE,
            StageAffinity::Model,
            Arc::new(RemoveStepHandler::new()),
        )
        .register(
            group_deployment.clone(),
            ADD,
            StageAffinity::Model,
            Arc::new(AddStepHandler::new(deployment_attributes())),
        )
        .register(
            group_deployment.clone(),
            REMOVE,
            StageAffinity::Model,
            Arc::new(RemoveStepHandler::new()),
        )
        .register(
            group_deployment.clone(),
            DEPLOY,
            StageAffinity::Model,
            Arc::new(DeployHandler::model_only()),
        )
        .register(
            group_deployment,
            UNDEPLOY,
            StageAffinity::Model,
            Arc::new(UndeployHandler::model_only()),
        );
}
