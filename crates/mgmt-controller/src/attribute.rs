//! Attribute definitions
//!
//! An [`AttributeDefinition`] describes one attribute of a resource type:
//! its name, value type, whether it is required and its default. Add and
//! write-attribute handlers use it to validate operation parameters before
//! copying them into the working model.

use crate::error::OperationFailure;
use mgmt_model::{ModelType, ModelValue};

/// Typed attribute of a resource, with optional default
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDefinition {
    name: String,
    ty: ModelType,
    required: bool,
    default: Option<ModelValue>,
}

impl AttributeDefinition {
    /// Optional attribute of type `ty` with no default
    pub fn new(name: impl Into<String>, ty: ModelType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
        }
    }

    /// Reject models that leave the attribute undefined
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Value used when the attribute is absent
    #[must_use]
    pub fn with_default(mut self, value: impl Into<ModelValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Attribute name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expected type
    #[must_use]
    pub fn model_type(&self) -> ModelType {
        self.ty
    }

    /// Whether the attribute must be defined
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Default applied by add
    #[must_use]
    pub fn default_value(&self) -> Option<&ModelValue> {
        self.default.as_ref()
    }

    /// Check a candidate value
    ///
    /// Undefined passes unless the attribute is required and has no default.
    ///
    /// # Errors
    /// [`OperationFailure::Validation`].
    pub fn validate(&self, value: &ModelValue) -> Result<(), OperationFailure> {
        if !value.is_defined() {
            if self.required && self.default.is_none() {
                return Err(OperationFailure::validation(format!(
                    "missing required attribute '{}'",
                    self.name
                )));
            }
            return Ok(());
        }
        if value.model_type() != self.ty {
            return Err(OperationFailure::validation(format!(
                "attribute '{}' expects {}, got {}",
                self.name,
                self.ty,
                value.model_type()
            )));
        }
        Ok(())
    }

    /// Validate the parameter named after this attribute and store it in
    /// `model`, falling back to the default when absent
    ///
    /// # Errors
    /// [`OperationFailure::Validation`], or a model error when `model` is
    /// not writable.
    pub fn validate_and_set(
        &self,
        params: &ModelValue,
        model: &mut ModelValue,
    ) -> Result<(), OperationFailure> {
        let value = params.get(&self.name)?;
        self.validate(value)?;
        let value = if value.is_defined() {
            value.clone()
        } else if let Some(default) = &self.default {
            default.clone()
        } else {
            return Ok(());
        };
        model.set(&self.name, value)?;
        Ok(())
    }
}

/// Find the definition for `name`
pub(crate) fn find<'a>(
    definitions: &'a [AttributeDefinition],
    name: &str,
) -> Option<&'a AttributeDefinition> {
    definitions.iter().find(|d| d.name == name)
}
