//! Configuration template written by `init`.

use dspace_pump::MigrateError;
use std::path::Path;

pub const SAMPLE_CONFIG: &str = r#"# dspace-pump configuration

backend:
  endpoint: http://localhost:8080/server/api/
  user: admin@example.org
  password: change-me

databases:
  # Destination, used for verification, version histories and sequences.
  dspace7:
    host: localhost
    database: dspace
    user: dspace
    password: dspace
  dspace5:
    host: localhost
    database: clarin-dspace
    user: dspace
    password: dspace
  utilities5:
    host: localhost
    database: clarin-utilities
    user: dspace
    password: dspace

http:
  max_attempts: 3
  base_delay_ms: 1000
  backoff_factor: 1.5
  read_timeout_secs: 120
  breaker_threshold: 5
  breaker_cooldown_secs: 60

sql:
  max_attempts: 5
  chunk_threshold: 100000
  chunk_size: 50000

migration:
  resume_dir: __temp/resume
  # snapshot_dir: input/tempdbexport_v5
  use_snapshots: false
  checkpoint_every: 500
  version_date_fields:
    - dc.date.issued
    - dc.date.accessioned
  ignored_epersons: []
  replaced_metadata_fields:
    local.hasMetadata: local.hasCMDI
"#;

/// Write [`SAMPLE_CONFIG`] to `output`. An existing file is kept unless `force`.
pub fn write_sample(output: &Path, force: bool) -> Result<(), MigrateError> {
    if output.exists() && !force {
        return Err(MigrateError::Config(format!(
            "{} already exists (use --force to overwrite)",
            output.display()
        )));
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, SAMPLE_CONFIG)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspace_pump::Config;

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.migration.checkpoint_every, 500);
        assert_eq!(config.databases.utilities5.database, "clarin-utilities");
        assert_eq!(
            config.migration.version_date_fields,
            vec!["dc.date.issued", "dc.date.accessioned"]
        );
    }
}
