//! Generic add and remove handlers
//!
//! Both work on the address of the operation. With a service attached they
//! also schedule a RUNTIME step that installs or removes the service named
//! after that address, registering the compensating action with the context.

use crate::attribute::AttributeDefinition;
use crate::context::OperationContext;
use crate::error::OperationFailure;
use crate::handler::StepHandler;
use crate::handlers::global::flag_param;
use crate::stage::Stage;
use async_trait::async_trait;
use mgmt_model::{ModelValue, Operation, PathAddress};
use std::sync::Arc;

/// Name of the add operation
pub const ADD: &str = "add";
/// Name of the remove operation
pub const REMOVE: &str = "remove";

/// Creates the addressed resource from validated parameters
#[derive(Debug, Default, Clone)]
pub struct AddStepHandler {
    definitions: Vec<AttributeDefinition>,
    service: bool,
}

impl AddStepHandler {
    /// Add handler validating against `definitions`
    #[must_use]
    pub fn new(definitions: Vec<AttributeDefinition>) -> Self {
        Self {
            definitions,
            service: false,
        }
    }

    /// Also install a service for the new resource during RUNTIME
    #[must_use]
    pub fn with_service(mut self) -> Self {
        self.service = true;
        self
    }

    /// Attribute model built from the operation parameters
    fn populate(&self, operation: &Operation) -> Result<ModelValue, OperationFailure> {
        let mut model = ModelValue::new_object();
        for definition in &self.definitions {
            definition.validate_and_set(&operation.params, &mut model)?;
        }
        Ok(model)
    }
}

#[async_trait]
impl StepHandler for AddStepHandler {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), OperationFailure> {
        // validate before touching the tree
        let model = self.populate(operation)?;
        let config = self.service.then(|| model.clone());
        ctx.create_resource(&PathAddress::root())?
            .model_mut()
            .set_value(model)?;
        if let Some(config) = config {
            ctx.add_step(Arc::new(InstallService { config }), Stage::Runtime)?;
        }
        ctx.complete_step()
    }
}

/// Detaches the addressed resource
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveStepHandler {
    recursive: bool,
    service: bool,
}

impl RemoveStepHandler {
    /// Remove handler refusing resources with children
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove resources that still have children
    #[must_use]
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    /// Also remove the resource's service during RUNTIME
    #[must_use]
    pub fn with_service(mut self) -> Self {
        self.service = true;
        self
    }
}

#[async_trait]
impl StepHandler for RemoveStepHandler {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), OperationFailure> {
        let here = PathAddress::root();
        let recursive = self.recursive || flag_param(operation, "recursive")?;
        if !recursive && ctx.read_resource(&here)?.has_children() {
            return Err(OperationFailure::validation(format!(
                "{} has children; remove them first",
                ctx.current_address()
            )));
        }
        let removed = ctx.remove_resource(&here)?;
        if self.service {
            let config = removed.model().clone();
            ctx.add_step(Arc::new(RemoveService { config }), Stage::Runtime)?;
        }
        ctx.complete_step()
    }
}

/// RUNTIME step: install the service named after the current address
#[derive(Debug)]
pub(crate) struct InstallService {
    pub(crate) config: ModelValue,
}

#[async_trait]
impl StepHandler for InstallService {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
    ) -> Result<(), OperationFailure> {
        let name = ctx.current_address().to_string();
        let services = ctx.service_controller();
        // remove tolerates a service that never came up
        {
            let services = Arc::clone(&services);
            let name = name.clone();
            ctx.register_rollback(format!("remove service {name}"), move || async move {
                services.remove(&name).await.map_err(OperationFailure::from)
            });
        }
        services.install(&name, self.config.clone()).await?;
        tracing::debug!(service = %name, "service installed");
        ctx.complete_step()
    }
}

/// RUNTIME step: remove the service named after the current address
#[derive(Debug)]
pub(crate) struct RemoveService {
    pub(crate) config: ModelValue,
}

#[async_trait]
impl StepHandler for RemoveService {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        _operation: &Operation,
    ) -> Result<(), OperationFailure> {
        let name = ctx.current_address().to_string();
        let services = ctx.service_controller();
        if !services.is_installed(&name).await {
            return ctx.complete_step();
        }
        services.remove(&name).await?;
        tracing::debug!(service = %name, "service removed");
        let config = self.config.clone();
        ctx.register_rollback(format!("reinstall service {name}"), move || async move {
            services
                .install(&name, config)
                .await
                .map_err(OperationFailure::from)
        });
        ctx.complete_step()
    }
}
