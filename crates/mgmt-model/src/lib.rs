//! Management model primitives
//!
//! Leaf types shared by the controller and its handlers:
//!
//! - [`PathAddress`]: immutable `(type, name)` segment sequences naming a
//!   resource, with wildcard matching for handler registration
//! - [`ModelValue`]: the recursively-typed, freezable value used for stored
//!   configuration, operation parameters and results
//! - [`ContentHash`]: Blake3 fingerprints of model values
//! - [`Operation`] / [`Request`]: single and composite operation requests

#![forbid(unsafe_code)]

pub mod address;
pub mod hash;
pub mod operation;
pub mod value;

pub use address::{AddressError, PathAddress, PathElement, WILDCARD};
pub use hash::{ContentHash, HashError};
pub use operation::{
    address_from_model, address_to_model, Operation, OperationParseError, Request, COMPOSITE,
};
pub use value::{ModelError, ModelType, ModelValue, Value, BYTES_TAG};
