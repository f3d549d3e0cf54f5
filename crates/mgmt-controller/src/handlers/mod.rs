//! Built-in step handlers

pub mod add_remove;
pub mod deployment;
pub mod global;

use crate::registry::HandlerRegistry;

pub use add_remove::{AddStepHandler, RemoveStepHandler, ADD, REMOVE};
pub use deployment::{
    deployment_attributes, register_deployment_handlers, DeployHandler, UndeployHandler, DEPLOY,
    ENABLED, UNDEPLOY,
};
pub use global::{
    register_global_handlers, ReadResourceHandler, WriteAttributeHandler, READ_ATTRIBUTE,
    READ_CHILDREN_NAMES, READ_OPERATION_NAMES, READ_RESOURCE, UNDEFINE_ATTRIBUTE, WRITE_ATTRIBUTE,
};

/// Registry with the global and deployment handlers
#[must_use]
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_builtin_handlers(&mut registry);
    registry
}

/// Register every built-in handler
pub fn register_builtin_handlers(registry: &mut HandlerRegistry) {
    register_global_handlers(registry);
    register_deployment_handlers(registry);
}
