//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Sessions are usually configured once from the host
//! application's settings file and share the same `RuntimeConfig`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The input was not valid JSON for this schema.
    #[error("invalid runtime configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A field parsed but holds an unusable value.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// Tuning knobs for a session's reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Upper bound on passes in a single flush. Effects that keep
    /// invalidating each other stop with `ReactiveError::FlushLimit`
    /// once this is exceeded.
    pub max_flush_passes: usize,

    /// Convert panics inside calc and effect bodies into cached
    /// evaluation errors instead of unwinding through the flush loop.
    pub catch_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_passes: 100,
            catch_panics: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_flush_passes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_flush_passes",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config =
            RuntimeConfig::from_json(r#"{ "max_flush_passes": 8, "catch_panics": false }"#)
                .unwrap();
        assert_eq!(config.max_flush_passes, 8);
        assert!(!config.catch_panics);
    }

    #[test]
    fn zero_passes_is_rejected() {
        let err = RuntimeConfig::from_json(r#"{ "max_flush_passes": 0 }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "max_flush_passes",
                ..
            }
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RuntimeConfig::from_json(r#"{ "max_passes": 3 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
