//! Driver construction parameters
//!
//! The platform hands the driver a flat string map; only the options
//! below are recognized and anything else is ignored.

use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{BackendError, Result};

pub const DEFAULT_KEY_ALIAS: &str = "alias/envelope-dynamo";
pub const DEFAULT_READ_CAPACITY: i64 = 10;
pub const DEFAULT_WRITE_CAPACITY: i64 = 10;

/// Settings for one DynamoDB-backed driver instance
#[derive(Clone, Deserialize)]
pub struct DynamoConfig {
    pub table_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_key_alias")]
    pub key_alias: String,
    #[serde(default = "default_read_capacity")]
    pub read_capacity: i64,
    #[serde(default = "default_write_capacity")]
    pub write_capacity: i64,
}

fn default_key_alias() -> String {
    DEFAULT_KEY_ALIAS.to_string()
}

fn default_read_capacity() -> i64 {
    DEFAULT_READ_CAPACITY
}

fn default_write_capacity() -> i64 {
    DEFAULT_WRITE_CAPACITY
}

impl DynamoConfig {
    /// Config with defaults for everything except the table name
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: None,
            key_alias: default_key_alias(),
            read_capacity: DEFAULT_READ_CAPACITY,
            write_capacity: DEFAULT_WRITE_CAPACITY,
        }
    }

    /// Build from the textual option map supplied at construction time
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let text = |name: &str| {
            params
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let table_name = text("table_name")
            .ok_or_else(|| BackendError::Config("table_name is not specified".into()))?;

        let mut config = Self::new(table_name);
        config.endpoint = text("endpoint");
        config.access_key = text("access_key");
        config.secret_key = text("secret_key");
        config.region = text("region");
        if let Some(alias) = text("key_alias") {
            config.key_alias = alias;
        }
        if let Some(raw) = text("read_capacity") {
            config.read_capacity = parse_capacity("read_capacity", &raw)?;
        }
        if let Some(raw) = text("write_capacity") {
            config.write_capacity = parse_capacity("write_capacity", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(BackendError::Config("table_name is not specified".into()));
        }
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(BackendError::Config(
                "access_key and secret_key must be set together".into(),
            ));
        }
        if self.read_capacity < 1 || self.write_capacity < 1 {
            return Err(BackendError::Config(
                "read_capacity and write_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_capacity(name: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|e| BackendError::Config(format!("invalid {} {:?}: {}", name, raw, e)))
}

impl std::fmt::Debug for DynamoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoConfig")
            .field("table_name", &self.table_name)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .field("region", &self.region)
            .field("key_alias", &self.key_alias)
            .field("read_capacity", &self.read_capacity)
            .field("write_capacity", &self.write_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_params() {
        let config = DynamoConfig::from_params(&params(&[
            ("type", "dynamodb"),
            ("table_name", "kv.dynamo.test"),
            ("endpoint", "http://localhost:8000"),
            ("access_key", "access_key"),
            ("secret_key", "secret_key"),
            ("read_capacity", "3"),
            ("unknown_option", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.table_name, "kv.dynamo.test");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.read_capacity, 3);
        assert_eq!(config.write_capacity, DEFAULT_WRITE_CAPACITY);
        assert_eq!(config.key_alias, DEFAULT_KEY_ALIAS);
    }

    #[test]
    fn test_missing_table_name() {
        let err = DynamoConfig::from_params(&params(&[("region", "us-west-2")])).unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));

        let err = DynamoConfig::from_params(&params(&[("table_name", "  ")])).unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }

    #[test]
    fn test_bad_capacity_and_partial_credentials() {
        let err = DynamoConfig::from_params(&params(&[
            ("table_name", "t"),
            ("write_capacity", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));

        let err = DynamoConfig::from_params(&params(&[
            ("table_name", "t"),
            ("access_key", "only-half"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut config = DynamoConfig::new("t");
        config.access_key = Some("AKIA".into());
        config.secret_key = Some("very-secret".into());
        let printed = format!("{:?}", config);
        assert!(!printed.contains("very-secret"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: DynamoConfig = serde_json::from_str(r#"{"table_name":"kv"}"#).unwrap();
        assert_eq!(config.read_capacity, DEFAULT_READ_CAPACITY);
        assert_eq!(config.key_alias, DEFAULT_KEY_ALIAS);
    }
}
