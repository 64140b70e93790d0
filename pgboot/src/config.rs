//! Configuration handling for pgboot

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientConfig, Environment, Readiness, ResetTarget};
use crate::db::connection::ClientOption;
use crate::db::driver::DriverConfig;
use crate::db::migrations::{MigrationSet, SqlSource};
use crate::error::{Error, Result};

/// Load configuration from a TOML file, or YAML when the extension is
/// `.yaml` or `.yml`
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

    let yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );

    let config: Config = if yaml {
        serde_yaml::from_str(&config_str)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
    } else {
        toml::from_str(&config_str)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
    };

    Ok(config)
}

/// Durations written as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Represents the complete pgboot configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DriverConfig,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub migrations: MigrationsConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub reset: ResetConfig,
    pub logging: Option<LoggingConfig>,
}

/// Client behavior and pool sizing
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ClientSection {
    pub discard_unknown_columns: bool,
    pub reset_on_conn: bool,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub acquire_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub idle_timeout: Option<Duration>,
    pub missing_relation_marker: Option<String>,
}

impl ClientSection {
    fn options(&self) -> Vec<ClientOption> {
        let mut options = Vec::new();
        if let Some(max) = self.max_connections {
            options.push(ClientOption::MaxConnections(max));
        }
        if let Some(min) = self.min_connections {
            options.push(ClientOption::MinConnections(min));
        }
        if let Some(timeout) = self.acquire_timeout {
            options.push(ClientOption::AcquireTimeout(timeout));
        }
        if let Some(timeout) = self.idle_timeout {
            options.push(ClientOption::IdleTimeout(timeout));
        }
        if let Some(marker) = &self.missing_relation_marker {
            options.push(ClientOption::MissingRelationMarker(marker.clone()));
        }
        options
    }
}

/// Migration settings configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Directories scanned for SQL migrations, in registration order.
    pub directories: Vec<PathBuf>,
    /// Control table name, `pgboot_migrations` when unset.
    pub table: Option<String>,
}

/// Readiness wait timings in milliseconds
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        let readiness = Readiness::default();
        Self {
            timeout_ms: readiness.timeout.as_millis() as u64,
            interval_ms: readiness.interval.as_millis() as u64,
        }
    }
}

impl From<ReadinessConfig> for Readiness {
    fn from(config: ReadinessConfig) -> Self {
        Readiness {
            timeout: Duration::from_millis(config.timeout_ms),
            interval: Duration::from_millis(config.interval_ms),
        }
    }
}

/// Schema reset target
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ResetConfig {
    pub schema: String,
    pub role: String,
}

impl Default for ResetConfig {
    fn default() -> Self {
        let target = ResetTarget::default();
        Self {
            schema: target.schema,
            role: target.role,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: String,
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: "text".to_string(),
            stdout: true,
        }
    }
}

impl Config {
    /// Migration set over the configured directories, `None` when there are none.
    pub fn migration_set(&self) -> Option<MigrationSet> {
        if self.migrations.directories.is_empty() {
            return None;
        }

        let mut set = MigrationSet::new();
        if let Some(table) = &self.migrations.table {
            set = set.with_table(table.clone());
        }
        set.register_sql(self.migrations.directories.iter().cloned().map(SqlSource::Dir));
        Some(set)
    }

    /// Client configuration for the given environment.
    pub fn client_config(&self, environment: Environment) -> ClientConfig<DriverConfig> {
        let mut config = ClientConfig::new(self.database.clone())
            .discard_unknown_columns(self.client.discard_unknown_columns)
            .reset_on_conn(self.client.reset_on_conn)
            .environment(environment)
            .readiness(self.readiness.into())
            .reset_target(ResetTarget {
                schema: self.reset.schema.clone(),
                role: self.reset.role.clone(),
            });

        config.migrations = self.migration_set();
        config.options = self.client.options();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::Builder;

    const TOML_CONFIG: &str = r#"
        [database]
        driver = "simple"
        addr = "localhost:5432"
        user = "app"
        database = "app"
        dial_timeout = 3000

        [client]
        reset_on_conn = true
        max_connections = 4
        acquire_timeout = 1500

        [migrations]
        directories = ["./migrations", "./seeds"]
        table = "schema_versions"

        [readiness]
        timeout_ms = 2000

        [logging]
        level = "debug"
        format = "json"
    "#;

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_toml() {
        let file = write_config(".toml", TOML_CONFIG);
        let config = load_from_file(file.path()).unwrap();

        assert!(matches!(config.database, DriverConfig::Simple(_)));
        assert_eq!(config.readiness.timeout_ms, 2000);
        assert_eq!(config.readiness.interval_ms, 250);
        assert_eq!(config.reset, ResetConfig::default());

        let logging = config.logging.clone().unwrap();
        assert_eq!(logging.level, "debug");
        assert!(logging.stdout);

        let client = config.client_config(Environment::Test);
        assert!(client.reset_on_conn);
        assert_eq!(client.environment, Environment::Test);
        assert_eq!(client.readiness.timeout, Duration::from_secs(2));
        assert_eq!(
            client.computed_options(),
            vec![
                ClientOption::MaxConnections(4),
                ClientOption::AcquireTimeout(Duration::from_millis(1500)),
            ]
        );

        let migrations = client.migrations.unwrap();
        assert_eq!(migrations.table(), "schema_versions");
        assert!(!migrations.is_empty());
    }

    #[test]
    fn loads_yaml() {
        let file = write_config(
            ".yaml",
            r#"
database:
  driver: extended
  dsn: postgres://app@localhost/app
  keep_implicit_prepared_statements: true
reset:
  schema: it
  role: ci
"#,
        );
        let config = load_from_file(file.path()).unwrap();

        match &config.database {
            DriverConfig::Extended(driver) => assert!(driver.keep_implicit_prepared_statements),
            other => panic!("unexpected driver: {other:?}"),
        }
        assert!(config.migration_set().is_none());

        let client = config.client_config(Environment::Other);
        assert_eq!(client.reset.schema, "it");
        assert_eq!(client.reset.role, "ci");
        assert!(client.migrations.is_none());
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let file = write_config(".toml", "[database]\ndriver = \"oracle\"\n");
        let err = load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = load_from_file("/does/not/exist.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
