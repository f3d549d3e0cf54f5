//! Runtime service collaborator
//!
//! RUNTIME-stage handlers apply their effects through a
//! [`ServiceController`]. `remove` must succeed for names that were never
//! installed: rollback calls it speculatively.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mgmt_model::ModelValue;

/// Starts and stops live services on behalf of handlers
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Install and start a service
    async fn install(&self, name: &str, config: ModelValue) -> Result<(), ServiceError>;

    /// Stop and remove a service; unknown names are not an error
    async fn remove(&self, name: &str) -> Result<(), ServiceError>;

    async fn is_installed(&self, name: &str) -> bool;
}

/// Service collaborator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// A service with this name is already running
    #[error("service already installed: {0}")]
    AlreadyInstalled(String),

    /// Install or remove failed
    #[error("service {name} failed: {reason}")]
    Failed {
        /// Service name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// The container cannot take requests
    #[error("service container unavailable: {0}")]
    Unavailable(String),
}

/// A running service
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Configuration it was installed with
    pub config: ModelValue,
    /// When it was installed
    pub installed_at: DateTime<Utc>,
}

/// Default in-process service container
#[derive(Debug, Default)]
pub struct InMemoryServiceRegistry {
    services: DashMap<String, ServiceRecord>,
}

impl InMemoryServiceRegistry {
    /// Empty container
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed service names, sorted
    #[must_use]
    pub fn installed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Record of a running service
    #[must_use]
    pub fn record(&self, name: &str) -> Option<ServiceRecord> {
        self.services.get(name).map(|r| r.value().clone())
    }

    /// Number of running services
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service runs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl ServiceController for InMemoryServiceRegistry {
    async fn install(&self, name: &str, config: ModelValue) -> Result<(), ServiceError> {
        match self.services.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ServiceError::AlreadyInstalled(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ServiceRecord {
                    config,
                    installed_at: Utc::now(),
                });
                tracing::debug!(service = name, "service installed");
                Ok(())
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        if self.services.remove(name).is_some() {
            tracing::debug!(service = name, "service removed");
        }
        Ok(())
    }

    async fn is_installed(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}
