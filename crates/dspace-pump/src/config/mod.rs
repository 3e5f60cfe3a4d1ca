//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

#[cfg(test)]
pub(crate) use validation::tests::valid_config;

use crate::error::{MigrateError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_overrides(path, &[])
    }

    /// Load configuration from a YAML file, then apply `a.b.c=value` overrides.
    pub fn load_with_overrides<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_with_overrides(&content, overrides)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_overrides(yaml, &[])
    }

    /// Parse configuration from a YAML string, then apply overrides.
    pub fn from_yaml_with_overrides(yaml: &str, overrides: &[String]) -> Result<Self> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        for item in overrides {
            apply_override(&mut doc, item)?;
        }
        let config: Config = serde_yaml::from_value(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 fingerprint of the source and destination identity.
    ///
    /// Checkpoints written under one fingerprint are only resumed under the
    /// same fingerprint. Tuning knobs (workers, retry delays) are excluded.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.backend.endpoint.trim_end_matches('/').as_bytes());
        for db in [
            &self.databases.dspace7,
            &self.databases.dspace5,
            &self.databases.utilities5,
        ] {
            hasher.update(b"\0");
            hasher.update(db.host.as_bytes());
            hasher.update(db.port.to_be_bytes());
            hasher.update(db.database.as_bytes());
        }
        hasher.update([self.migration.use_snapshots as u8]);
        format!("{:x}", hasher.finalize())
    }

    /// Absolute API URL for a relative path.
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.backend.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl DatabaseConfig {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode.as_str() {
            "disable" => "disable",
            _ => "require",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            self.host,
            self.port,
            self.database,
            self.user,
            self.password,
            sslmode,
            self.connect_timeout_secs
        )
    }

    /// Human-readable identity without credentials.
    pub fn describe(&self) -> String {
        format!("{}@{}:{}", self.database, self.host, self.port)
    }
}

/// Set `dotted.key=value` inside a YAML document, creating mappings as needed.
fn apply_override(doc: &mut serde_yaml::Value, item: &str) -> Result<()> {
    let (key, raw) = item
        .split_once('=')
        .ok_or_else(|| MigrateError::Config(format!("override '{}' is not key=value", item)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(MigrateError::Config(format!("override '{}' has an empty key", item)));
    }

    let value: serde_yaml::Value = serde_yaml::from_str(raw.trim())
        .unwrap_or_else(|_| serde_yaml::Value::String(raw.trim().to_string()));

    let mut node = doc;
    for part in key.split('.') {
        if !node.is_mapping() {
            *node = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| MigrateError::Config(format!("override '{}' hits a non-mapping", item)))?;
        node = map
            .entry(serde_yaml::Value::String(part.to_string()))
            .or_insert(serde_yaml::Value::Null);
    }
    *node = value;
    Ok(())
}
