//! Provider configuration.
//!
//! ```json
//! { "file": "/var/run/my-group.json",
//!   "credentials": 0,
//!   "group": { "type": "swim", "config": { "protocol_period_ms": 500 } } }
//! ```
//!
//! Bootstrap-side helpers recognize additional keys (`bootstrap`,
//! `mpi_ranks`); those live outside this crate and are ignored here.

use crate::types::{Credentials, FlockError};
use std::path::PathBuf;

/// Which backend a provider hosts and its backend-specific options.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub backend: String,
    pub config: serde_json::Value,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            backend: "static".to_string(),
            config: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// Group file rewritten on membership changes, when this provider
    /// holds position 0 of the view.
    pub file: Option<PathBuf>,
    pub credentials: Credentials,
    pub group: GroupConfig,
}

impl ProviderConfig {
    pub fn from_str(text: &str) -> Result<Self, FlockError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| FlockError::InvalidConfig(format!("config is not valid JSON: {e}")))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, FlockError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FlockError::InvalidConfig("config must be a JSON object".into()))?;

        let file = match obj.get("file") {
            Some(serde_json::Value::String(s)) => Some(PathBuf::from(s)),
            Some(serde_json::Value::Null) | None => None,
            Some(_) => {
                return Err(FlockError::InvalidConfig("\"file\" must be a string".into()));
            }
        };

        let credentials = match obj.get("credentials") {
            Some(v) => v.as_i64().ok_or_else(|| {
                FlockError::InvalidConfig("\"credentials\" must be an integer".into())
            })?,
            None => 0,
        };

        let group = match obj.get("group") {
            Some(group_value) => {
                let group = group_value.as_object().ok_or_else(|| {
                    FlockError::InvalidConfig("\"group\" must be an object".into())
                })?;
                let backend = match group.get("type") {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(_) => {
                        return Err(FlockError::InvalidConfig(
                            "\"group.type\" must be a string".into(),
                        ));
                    }
                    None => {
                        return Err(FlockError::InvalidConfig(
                            "missing \"group.type\" field".into(),
                        ));
                    }
                };
                let config = match group.get("config") {
                    Some(v @ serde_json::Value::Object(_)) => v.clone(),
                    Some(serde_json::Value::Null) | None => serde_json::json!({}),
                    Some(_) => {
                        return Err(FlockError::InvalidConfig(
                            "\"group.config\" must be an object".into(),
                        ));
                    }
                };
                GroupConfig { backend, config }
            }
            None => GroupConfig::default(),
        };

        Ok(Self { file, credentials, group })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = ProviderConfig::from_str(
            r#"{ "file": "/tmp/group.json",
                 "credentials": 42,
                 "group": { "type": "swim",
                            "config": { "protocol_period_ms": 250 } } }"#,
        )
        .unwrap();

        assert_eq!(config.file.as_deref(), Some(std::path::Path::new("/tmp/group.json")));
        assert_eq!(config.credentials, 42);
        assert_eq!(config.group.backend, "swim");
        assert_eq!(config.group.config["protocol_period_ms"], 250);
    }

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::from_str("{}").unwrap();
        assert!(config.file.is_none());
        assert_eq!(config.credentials, 0);
        assert_eq!(config.group.backend, "static");
    }

    #[test]
    fn test_missing_type_rejected() {
        let err = ProviderConfig::from_str(r#"{ "group": {} }"#).unwrap_err();
        assert!(matches!(err, FlockError::InvalidConfig(_)));
    }

    #[test]
    fn test_wrong_file_type_rejected() {
        let err = ProviderConfig::from_str(r#"{ "file": 7 }"#).unwrap_err();
        assert!(matches!(err, FlockError::InvalidConfig(_)));
    }
}
