//! Configuration validation.

use super::{Config, DatabaseConfig};
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.backend.endpoint.is_empty() {
        return Err(MigrateError::Config("backend.endpoint is required".into()));
    }
    if !config.backend.endpoint.starts_with("http://")
        && !config.backend.endpoint.starts_with("https://")
    {
        return Err(MigrateError::Config(format!(
            "backend.endpoint must be an http(s) URL, got '{}'",
            config.backend.endpoint
        )));
    }
    if config.backend.user.is_empty() {
        return Err(MigrateError::Config("backend.user is required".into()));
    }

    validate_database("databases.dspace7", &config.databases.dspace7)?;
    validate_database("databases.dspace5", &config.databases.dspace5)?;
    validate_database("databases.utilities5", &config.databases.utilities5)?;

    if config.http.max_attempts == 0 {
        return Err(MigrateError::Config(
            "http.max_attempts must be at least 1".into(),
        ));
    }
    if config.http.backoff_factor < 1.0 {
        return Err(MigrateError::Config(
            "http.backoff_factor must be >= 1.0".into(),
        ));
    }
    if config.http.breaker_threshold == 0 {
        return Err(MigrateError::Config(
            "http.breaker_threshold must be at least 1".into(),
        ));
    }
    if config.sql.max_attempts == 0 {
        return Err(MigrateError::Config(
            "sql.max_attempts must be at least 1".into(),
        ));
    }
    if config.sql.chunk_size == 0 {
        return Err(MigrateError::Config(
            "sql.chunk_size must be at least 1".into(),
        ));
    }

    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if config.migration.checkpoint_every == 0 {
        return Err(MigrateError::Config(
            "migration.checkpoint_every must be at least 1".into(),
        ));
    }
    if config.migration.use_snapshots && config.migration.snapshot_dir.is_none() {
        return Err(MigrateError::Config(
            "migration.use_snapshots requires migration.snapshot_dir".into(),
        ));
    }
    if config.migration.version_date_fields.is_empty() {
        return Err(MigrateError::Config(
            "migration.version_date_fields must name at least one field".into(),
        ));
    }
    for field in &config.migration.version_date_fields {
        let parts = field.split('.').count();
        if !(2..=3).contains(&parts) || field.split('.').any(str::is_empty) {
            return Err(MigrateError::Config(format!(
                "migration.version_date_fields: '{}' is not schema.element[.qualifier]",
                field
            )));
        }
    }

    Ok(())
}

fn validate_database(name: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", name)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", name)));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", name)));
    }
    match db.ssl_mode.as_str() {
        "disable" | "require" | "verify-full" => Ok(()),
        other => Err(MigrateError::Config(format!(
            "{}.ssl_mode must be disable, require or verify-full, got '{}'",
            name, other
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{
        BackendConfig, DatabasesConfig, MigrationConfig, RetryPolicy, SqlRetryPolicy,
    };

    fn db(name: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: name.to_string(),
            user: "dspace".to_string(),
            password: "dspace".to_string(),
            ssl_mode: "disable".to_string(),
            connect_timeout_secs: 10,
            statement_timeout_secs: 600,
        }
    }

    pub(crate) fn valid_config() -> Config {
        Config {
            backend: BackendConfig {
                endpoint: "http://localhost:8080/server/api/".to_string(),
                user: "admin@example.org".to_string(),
                password: "admin".to_string(),
                authenticate: true,
            },
            databases: DatabasesConfig {
                dspace7: db("dspace"),
                dspace5: db("clarin-dspace"),
                utilities5: db("clarin-utilities"),
            },
            http: RetryPolicy::default(),
            sql: SqlRetryPolicy::default(),
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_endpoint() {
        let mut config = valid_config();
        config.backend.endpoint = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_database_host() {
        let mut config = valid_config();
        config.databases.utilities5.host = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("databases.utilities5.host"));
    }

    #[test]
    fn test_empty_version_date_fields_is_fatal() {
        let mut config = valid_config();
        config.migration.version_date_fields.clear();
        assert!(matches!(validate(&config), Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_malformed_version_date_field() {
        let mut config = valid_config();
        config.migration.version_date_fields = vec!["issued".to_string()];
        assert!(validate(&config).is_err());
        config.migration.version_date_fields = vec!["dc..issued".to_string()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_snapshots_require_directory() {
        let mut config = valid_config();
        config.migration.use_snapshots = true;
        assert!(validate(&config).is_err());
        config.migration.snapshot_dir = Some("input/tempdbexport_v5".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_backoff_factor_below_one() {
        let mut config = valid_config();
        config.http.backoff_factor = 0.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_backend_debug_redacts_password() {
        let mut config = valid_config();
        config.backend.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.backend);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }

    #[test]
    fn test_database_debug_redacts_password() {
        let mut config = valid_config();
        config.databases.dspace5.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config.databases);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_456"));
    }
}
