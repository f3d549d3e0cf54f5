//! Operation requests
//!
//! An [`Operation`] is a named action with parameters, targeted at a
//! [`PathAddress`]. Its model form is the object
//! `{"operation": name, "address": [...], <params>}`; a model whose operation
//! is `composite` carries its sub-operations under `steps` and converts into a
//! [`Request::Composite`].

use crate::address::{AddressError, PathAddress, PathElement};
use crate::value::{ModelError, ModelValue, Value};
use std::fmt::{self, Display, Formatter};

/// Name of the batch operation in model form
pub const COMPOSITE: &str = "composite";

const OPERATION_KEY: &str = "operation";
const ADDRESS_KEY: &str = "address";
const STEPS_KEY: &str = "steps";

/// A named action targeted at an address
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Target resource
    pub address: PathAddress,
    /// Operation name
    pub name: String,
    /// Parameters; an object or undefined
    pub params: ModelValue,
}

impl Operation {
    /// Operation with no parameters
    #[must_use]
    pub fn new(address: PathAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            params: ModelValue::new_object(),
        }
    }

    /// Add a parameter
    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<ModelValue>) -> Self {
        if self.params.is_protected() || self.params.as_object().is_err() {
            self.params = ModelValue::new_object();
        }
        // cannot fail on an unprotected object
        let _ = self.params.set(key, value);
        self
    }

    /// Parameter value, undefined when absent
    #[must_use]
    pub fn param(&self, key: &str) -> &ModelValue {
        static ABSENT: ModelValue = ModelValue::undefined();
        self.params.get(key).unwrap_or(&ABSENT)
    }

    /// Parse the model form
    ///
    /// # Errors
    /// Returns [`OperationParseError`] when `operation` is missing or the
    /// address is malformed.
    pub fn from_model(model: &ModelValue) -> Result<Self, OperationParseError> {
        let object = model.as_object()?;
        let name = object
            .get(OPERATION_KEY)
            .ok_or(OperationParseError::MissingOperation)?
            .as_str()?
            .to_string();
        let address = match object.get(ADDRESS_KEY) {
            Some(a) => address_from_model(a)?,
            None => PathAddress::root(),
        };
        let params = object
            .iter()
            .filter(|(k, _)| k.as_str() != OPERATION_KEY && k.as_str() != ADDRESS_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            address,
            name,
            params,
        })
    }

    /// Model form
    #[must_use]
    pub fn to_model(&self) -> ModelValue {
        let mut entries: Vec<(String, ModelValue)> = vec![
            (OPERATION_KEY.to_string(), self.name.as_str().into()),
            (ADDRESS_KEY.to_string(), address_to_model(&self.address)),
        ];
        if let Ok(params) = self.params.as_object() {
            entries.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        entries.into_iter().collect()
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.name)
    }
}

/// A single operation or an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// One operation
    Single(Operation),
    /// Sub-operations, applied all or nothing
    Composite(Vec<Operation>),
}

impl Request {
    /// Parse a model, recognising the `composite` form
    ///
    /// # Errors
    /// Same as [`Operation::from_model`]; a composite without a `steps` list
    /// is [`OperationParseError::MissingSteps`].
    pub fn from_model(model: &ModelValue) -> Result<Self, OperationParseError> {
        let name = model.get(OPERATION_KEY)?;
        if name.as_str().ok() != Some(COMPOSITE) {
            return Operation::from_model(model).map(Request::Single);
        }
        let steps = model.get(STEPS_KEY)?;
        if !steps.is_defined() {
            return Err(OperationParseError::MissingSteps);
        }
        steps
            .as_list()?
            .iter()
            .map(Operation::from_model)
            .collect::<Result<Vec<_>, _>>()
            .map(Request::Composite)
    }

    /// Operations in submission order
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        match self {
            Request::Single(op) => std::slice::from_ref(op),
            Request::Composite(ops) => ops,
        }
    }

    /// Whether this is a batch
    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, Request::Composite(_))
    }
}

/// Parse an address given either as text or as a list of single-entry objects
///
/// # Errors
/// [`OperationParseError::Address`] or [`OperationParseError::Model`] for a
/// value of the wrong shape.
pub fn address_from_model(model: &ModelValue) -> Result<PathAddress, OperationParseError> {
    match model.value() {
        Value::Undefined => Ok(PathAddress::root()),
        Value::String(s) => Ok(s.parse()?),
        Value::List(items) => items
            .iter()
            .map(|item| {
                let object = item.as_object()?;
                let mut entries = object.iter();
                match (entries.next(), entries.next()) {
                    (Some((key, value)), None) => {
                        Ok(PathElement::new(key.as_str(), value.as_str()?))
                    }
                    _ => Err(OperationParseError::Address(AddressError::Malformed(
                        item.to_string(),
                    ))),
                }
            })
            .collect(),
        _ => Err(OperationParseError::Address(AddressError::Malformed(
            model.to_string(),
        ))),
    }
}

/// List-of-objects form of an address
#[must_use]
pub fn address_to_model(address: &PathAddress) -> ModelValue {
    address
        .iter()
        .map(|e| [(e.key(), e.value())].into_iter().collect::<ModelValue>())
        .collect::<Vec<_>>()
        .into()
}

/// Errors converting a model into an operation
#[derive(Debug, thiserror::Error)]
pub enum OperationParseError {
    /// No operation name
    #[error("missing 'operation' name")]
    MissingOperation,

    /// Composite without steps
    #[error("composite operation without a 'steps' list")]
    MissingSteps,

    /// Address text did not parse
    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    /// Model had the wrong shape
    #[error("invalid operation model: {0}")]
    Model(#[from] ModelError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn web_address() -> PathAddress {
        PathAddress::from_pairs([("subsystem", "web"), ("connector", "http")])
    }

    #[test]
    fn model_form_round_trips() {
        let op = Operation::new(web_address(), "write-attribute")
            .with_param("name", "enabled")
            .with_param("value", false);
        let model = op.to_model();
        assert_eq!(
            model.to_json(),
            json!({
                "operation": "write-attribute",
                "address": [{"subsystem": "web"}, {"connector": "http"}],
                "name": "enabled",
                "value": false
            })
        );
        assert_eq!(Operation::from_model(&model).unwrap(), op);
    }

    #[test]
    fn address_accepts_text_form() {
        let model = ModelValue::from_json(json!({
            "operation": "read-resource",
            "address": "/subsystem=web/connector=http",
            "recursive": true
        }));
        let op = Operation::from_model(&model).unwrap();
        assert_eq!(op.address, web_address());
        assert!(op.param("recursive").as_bool().unwrap());
        assert!(!op.param("missing").is_defined());
    }

    #[test]
    fn missing_address_targets_root() {
        let model = ModelValue::from_json(json!({"operation": "read-resource"}));
        assert!(Operation::from_model(&model).unwrap().address.is_empty());
    }

    #[test]
    fn missing_operation_is_rejected() {
        let model = ModelValue::from_json(json!({"address": []}));
        assert!(matches!(
            Operation::from_model(&model),
            Err(OperationParseError::MissingOperation)
        ));
    }

    #[test]
    fn multi_key_address_element_is_rejected() {
        let model = ModelValue::from_json(json!({
            "operation": "add",
            "address": [{"a": "1", "b": "2"}]
        }));
        assert!(matches!(
            Operation::from_model(&model),
            Err(OperationParseError::Address(_))
        ));
    }

    #[test]
    fn composite_model_yields_ordered_batch() {
        let model = ModelValue::from_json(json!({
            "operation": "composite",
            "steps": [
                {"operation": "add", "address": "/subsystem=jca"},
                {"operation": "add", "address": "/subsystem=jca/pool=default", "max": 10}
            ]
        }));
        let request = Request::from_model(&model).unwrap();
        assert!(request.is_composite());
        let names: Vec<_> = request.operations().iter().map(|o| o.address.to_string()).collect();
        assert_eq!(names, vec!["/subsystem=jca", "/subsystem=jca/pool=default"]);
    }

    #[test]
    fn composite_without_steps_is_rejected() {
        let model = ModelValue::from_json(json!({"operation": "composite"}));
        assert!(matches!(
            Request::from_model(&model),
            Err(OperationParseError::MissingSteps)
        ));
    }
}
