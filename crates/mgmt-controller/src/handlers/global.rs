//! Operations available at every address

use crate::attribute::{self, AttributeDefinition};
use crate::context::OperationContext;
use crate::error::OperationFailure;
use crate::handler::{handler_fn, StepHandler};
use crate::registry::HandlerRegistry;
use crate::stage::StageAffinity;
use async_trait::async_trait;
use mgmt_model::{ModelValue, Operation, PathAddress};
use std::sync::Arc;

/// Name of the read-resource operation
pub const READ_RESOURCE: &str = "read-resource";
/// Name of the read-attribute operation
pub const READ_ATTRIBUTE: &str = "read-attribute";
/// Name of the write-attribute operation
pub const WRITE_ATTRIBUTE: &str = "write-attribute";
/// Name of the undefine-attribute operation
pub const UNDEFINE_ATTRIBUTE: &str = "undefine-attribute";
/// Name of the read-children-names operation
pub const READ_CHILDREN_NAMES: &str = "read-children-names";
/// Name of the read-operation-names operation
pub const READ_OPERATION_NAMES: &str = "read-operation-names";

/// Required string parameter
pub(crate) fn string_param<'a>(operation: &'a Operation, key: &str) -> Result<&'a str, OperationFailure> {
    let value = operation.param(key);
    if !value.is_defined() {
        return Err(OperationFailure::validation(format!(
            "'{}' requires parameter '{key}'",
            operation.name
        )));
    }
    Ok(value.as_str()?)
}

/// Optional boolean parameter, false when absent
pub(crate) fn flag_param(operation: &Operation, key: &str) -> Result<bool, OperationFailure> {
    let value = operation.param(key);
    if value.is_defined() {
        Ok(value.as_bool()?)
    } else {
        Ok(false)
    }
}

/// `read-resource(recursive?)`
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadResourceHandler;

#[async_trait]
impl StepHandler for ReadResourceHandler {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), OperationFailure> {
        let recursive = flag_param(operation, "recursive")?;
        let resource = ctx.read_resource(&PathAddress::root())?;
        ctx.set_result(resource.to_model(recursive));
        ctx.complete_step()
    }
}

/// `write-attribute(name, value)`
///
/// With definitions, only known attributes of the right type are accepted.
#[derive(Debug, Default, Clone)]
pub struct WriteAttributeHandler {
    definitions: Arc<[AttributeDefinition]>,
}

impl WriteAttributeHandler {
    /// Untyped writes
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes checked against `definitions`
    #[must_use]
    pub fn with_definitions(definitions: Vec<AttributeDefinition>) -> Self {
        Self {
            definitions: definitions.into(),
        }
    }
}

#[async_trait]
impl StepHandler for WriteAttributeHandler {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &Operation,
    ) -> Result<(), OperationFailure> {
        let name = string_param(operation, "name")?;
        let value = operation.param("value").clone();
        if !self.definitions.is_empty() {
            let definition = attribute::find(&self.definitions, name).ok_or_else(|| {
                OperationFailure::validation(format!("unknown attribute '{name}'"))
            })?;
            definition.validate(&value)?;
        }
        ctx.read_resource_for_update(&PathAddress::root())?
            .model_mut()
            .set(name, value)?;
        ctx.complete_step()
    }
}

/// Register the global read and write operations
pub fn register_global_handlers(registry: &mut HandlerRegistry) {
    registry
        .register_global(READ_RESOURCE, StageAffinity::ReadOnly, Arc::new(ReadResourceHandler))
        .register_global(
            READ_ATTRIBUTE,
            StageAffinity::ReadOnly,
            handler_fn(|ctx, operation| {
                let name = string_param(operation, "name")?;
                let value = ctx.read_resource(&PathAddress::root())?.model().get(name)?.clone();
                ctx.set_result(value);
                ctx.complete_step()
            }),
        )
        .register_global(
            WRITE_ATTRIBUTE,
            StageAffinity::Model,
            Arc::new(WriteAttributeHandler::new()),
        )
        .register_global(
            UNDEFINE_ATTRIBUTE,
            StageAffinity::Model,
            handler_fn(|ctx, operation| {
                let name = string_param(operation, "name")?;
                ctx.read_resource_for_update(&PathAddress::root())?
                    .model_mut()
                    .remove(name)?;
                ctx.complete_step()
            }),
        )
        .register_global(
            READ_CHILDREN_NAMES,
            StageAffinity::ReadOnly,
            handler_fn(|ctx, operation| {
                let child_type = string_param(operation, "child-type")?;
                let names: Vec<ModelValue> = ctx
                    .read_resource(&PathAddress::root())?
                    .children_names(child_type)
                    .into_iter()
                    .map(ModelValue::from)
                    .collect();
                ctx.set_result(names);
                ctx.complete_step()
            }),
        )
        .register_global(
            READ_OPERATION_NAMES,
            StageAffinity::ReadOnly,
            handler_fn(|ctx, _| {
                let names: Vec<ModelValue> = ctx
                    .registry()
                    .operation_names(ctx.current_address())
                    .into_iter()
                    .map(ModelValue::from)
                    .collect();
                ctx.set_result(names);
                ctx.complete_step()
            }),
        );
}
