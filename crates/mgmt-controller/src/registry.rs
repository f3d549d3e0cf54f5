//! Handler registry
//!
//! Maps an address pattern plus operation name to a handler. Patterns may use
//! `*` as a segment name. Resolution picks the most specific matching pattern;
//! among equally specific ones the first registered wins. Global handlers
//! match every address and lose to any pattern registration.
//!
//! The registry is populated at start-up and frozen behind an [`Arc`] once
//! handed to the controller.

use crate::error::OperationFailure;
use crate::handler::SharedHandler;
use crate::stage::StageAffinity;
use mgmt_model::PathAddress;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
enum Scope {
    Global,
    Pattern(PathAddress),
}

impl Scope {
    fn matches(&self, address: &PathAddress) -> bool {
        match self {
            Scope::Global => true,
            Scope::Pattern(p) => address.matches(p),
        }
    }

    /// Global below every pattern, then by count of literal segments
    fn rank(&self) -> (bool, usize) {
        match self {
            Scope::Global => (false, 0),
            Scope::Pattern(p) => (true, p.specificity()),
        }
    }
}

#[derive(Clone)]
struct Registration {
    scope: Scope,
    operation: String,
    affinity: StageAffinity,
    handler: SharedHandler,
}

/// A resolved registration
#[derive(Clone)]
pub struct ResolvedHandler {
    /// Pattern the handler was registered under; `None` for global handlers
    pub pattern: Option<PathAddress>,
    /// Declared stage affinity
    pub affinity: StageAffinity,
    /// The handler itself
    pub handler: SharedHandler,
}

impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("pattern", &self.pattern)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

/// Address pattern + operation name -> handler
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `operation` at addresses matching `pattern`
    pub fn register(
        &mut self,
        pattern: PathAddress,
        operation: impl Into<String>,
        affinity: StageAffinity,
        handler: SharedHandler,
    ) -> &mut Self {
        let operation = operation.into();
        if self
            .registrations
            .iter()
            .any(|r| matches!(&r.scope, Scope::Pattern(p) if *p == pattern) && r.operation == operation)
        {
            tracing::warn!(%pattern, %operation, "duplicate registration ignored by resolution");
        }
        self.registrations.push(Registration {
            scope: Scope::Pattern(pattern),
            operation,
            affinity,
            handler,
        });
        self
    }

    /// Register `handler` for `operation` at every address
    pub fn register_global(
        &mut self,
        operation: impl Into<String>,
        affinity: StageAffinity,
        handler: SharedHandler,
    ) -> &mut Self {
        self.registrations.push(Registration {
            scope: Scope::Global,
            operation: operation.into(),
            affinity,
            handler,
        });
        self
    }

    /// Most specific handler for `operation` at `address`
    ///
    /// # Errors
    /// [`OperationFailure::HandlerNotFound`] when nothing matches.
    pub fn resolve(
        &self,
        address: &PathAddress,
        operation: &str,
    ) -> Result<ResolvedHandler, OperationFailure> {
        let mut best: Option<&Registration> = None;
        for candidate in self
            .registrations
            .iter()
            .filter(|r| r.operation == operation && r.scope.matches(address))
        {
            if best.map_or(true, |b| candidate.scope.rank() > b.scope.rank()) {
                best = Some(candidate);
            }
        }
        best.map(|r| ResolvedHandler {
            pattern: match &r.scope {
                Scope::Global => None,
                Scope::Pattern(p) => Some(p.clone()),
            },
            affinity: r.affinity,
            handler: Arc::clone(&r.handler),
        })
        .ok_or_else(|| OperationFailure::HandlerNotFound {
            address: address.clone(),
            operation: operation.to_string(),
        })
    }

    /// Names of operations resolvable at `address`, sorted
    #[must_use]
    pub fn operation_names(&self, address: &PathAddress) -> Vec<String> {
        let mut names: Vec<String> = self
            .registrations
            .iter()
            .filter(|r| r.scope.matches(address))
            .map(|r| r.operation.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Number of registrations
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
