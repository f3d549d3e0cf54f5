//! Controller configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for [`ModelController`](crate::ModelController)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Submission deadline in milliseconds
    pub operation_timeout_ms: u64,
    /// Upper bound on steps executed by one context
    pub max_steps: usize,
    /// Record outcomes in the operation journal
    pub journal_enabled: bool,
    /// Journal entries retained before the oldest are dropped
    pub journal_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 300_000,
            max_steps: 10_000,
            journal_enabled: true,
            journal_capacity: 1_024,
        }
    }
}

impl ControllerConfig {
    /// Deadline for submissions that carry none
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Steps one context may run before it fails
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Enable or disable the journal and set its bound
    #[must_use]
    pub fn with_journal(mut self, enabled: bool, capacity: usize) -> Self {
        self.journal_enabled = enabled;
        self.journal_capacity = capacity;
        self
    }

    /// Default submission deadline
    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// # Errors
    /// [`ConfigError::Invalid`] for zero timeouts, step limits or journal capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("operation_timeout_ms must be positive".into()));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be positive".into()));
        }
        if self.journal_enabled && self.journal_capacity == 0 {
            return Err(ConfigError::Invalid(
                "journal_capacity must be positive when the journal is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Parse or validation failure.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// I/O, parse or validation failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// TOML rendering of the effective configuration
    ///
    /// # Errors
    /// Serialization failure.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Errors loading or validating a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the file failed
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Rendering TOML failed
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.operation_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = ControllerConfig::from_toml_str(
            "operation_timeout_ms = 250\njournal_enabled = false\n",
        )
        .unwrap();
        assert_eq!(config.operation_timeout_ms, 250);
        assert!(!config.journal_enabled);
        assert_eq!(config.max_steps, 10_000);
    }

    #[test]
    fn zero_step_limit_is_rejected() {
        assert!(matches!(
            ControllerConfig::from_toml_str("max_steps = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            ControllerConfig::from_toml_str("max_steps = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rendering_parses_back() {
        let config = ControllerConfig::default()
            .with_operation_timeout(Duration::from_millis(1_500))
            .with_max_steps(64);
        let text = config.to_toml_string().unwrap();
        assert_eq!(ControllerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        std::fs::write(&path, "journal_capacity = 8\n").unwrap();
        assert_eq!(ControllerConfig::load(&path).unwrap().journal_capacity, 8);
    }
}
