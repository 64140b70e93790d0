//! Client bring-up
//!
//! [`new_client`] opens a store through a [`Driver`], waits until it answers,
//! optionally resets the test schema and applies pending migrations. If any
//! step after opening fails, both handles are released before the error is
//! returned. On success the caller owns both handles and must release them.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::db::connection::{ClientOption, Dialect};
use crate::db::driver::Driver;
use crate::db::executor::SqlExecutor;
use crate::db::migrations::MigrationSet;
use crate::db::store::{RawHandle, Store};
use crate::error::{Error, Result};
use crate::utils::ping::{wait_for_ping, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_TIMEOUT};

/// Environment variable holding the environment marker.
pub const ENV_VAR: &str = "ENV";

/// Deployment environment, as far as destructive operations are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Test,
    #[default]
    Other,
}

impl Environment {
    /// Read the marker from `ENV`. Only the exact value `test` selects
    /// [`Environment::Test`].
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(ENV_VAR).ok().as_deref())
    }

    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            Some("test") => Environment::Test,
            _ => Environment::Other,
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, Environment::Test)
    }
}

/// Timings of the readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RETRY_TIMEOUT,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Schema recreated by `reset_on_conn`, and the role granted access to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetTarget {
    pub schema: String,
    pub role: String,
}

impl Default for ResetTarget {
    fn default() -> Self {
        Self {
            schema: "test".to_string(),
            role: "test".to_string(),
        }
    }
}

impl ResetTarget {
    /// Statements that drop, recreate and grant the schema.
    pub fn statements(&self, dialect: Dialect) -> Vec<String> {
        let schema = dialect.quote_ident(&self.schema);
        let role = dialect.quote_ident(&self.role);

        vec![
            format!("DROP SCHEMA IF EXISTS {} CASCADE", schema),
            format!("CREATE SCHEMA IF NOT EXISTS {}", schema),
            format!("GRANT ALL ON SCHEMA {} TO {}", schema, role),
        ]
    }
}

/// Everything [`new_client`] needs.
#[derive(Debug, Clone)]
pub struct ClientConfig<D> {
    pub driver: D,
    pub migrations: Option<MigrationSet>,
    pub discard_unknown_columns: bool,
    /// Drop and recreate the reset schema after connecting. Refused unless
    /// `environment` is [`Environment::Test`].
    pub reset_on_conn: bool,
    pub environment: Environment,
    pub readiness: Readiness,
    pub reset: ResetTarget,
    /// Extra client options, applied after the computed ones.
    pub options: Vec<ClientOption>,
}

impl<D: Driver> ClientConfig<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            migrations: None,
            discard_unknown_columns: false,
            reset_on_conn: false,
            environment: Environment::default(),
            readiness: Readiness::default(),
            reset: ResetTarget::default(),
            options: Vec::new(),
        }
    }

    pub fn with_migrations(mut self, migrations: MigrationSet) -> Self {
        self.migrations = Some(migrations);
        self
    }

    pub fn discard_unknown_columns(mut self, discard: bool) -> Self {
        self.discard_unknown_columns = discard;
        self
    }

    pub fn reset_on_conn(mut self, reset: bool) -> Self {
        self.reset_on_conn = reset;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn reset_target(mut self, reset: ResetTarget) -> Self {
        self.reset = reset;
        self
    }

    pub fn with_option(mut self, option: ClientOption) -> Self {
        self.options.push(option);
        self
    }

    /// Client options handed to the driver.
    pub fn computed_options(&self) -> Vec<ClientOption> {
        let mut options = Vec::with_capacity(self.options.len() + 1);
        if self.discard_unknown_columns {
            options.push(ClientOption::DiscardUnknownColumns);
        }
        options.extend(self.options.iter().cloned());
        options
    }
}

/// Probe closure pinging `store`, for use with [`wait_for_ping`].
pub fn ping_store<'a, S: Store + ?Sized>(store: &'a S) -> impl FnMut() -> BoxFuture<'a, Result<()>> + 'a {
    move || store.ping()
}

/// Open, probe, optionally reset and migrate a store.
pub async fn new_client<D: Driver>(config: &mut ClientConfig<D>) -> Result<(D::Store, D::Raw)> {
    let (store, raw) = config
        .driver
        .connect(&config.computed_options())
        .map_err(|e| Error::Connect(Box::new(e)))?;

    match bring_up(config, &store).await {
        Ok(()) => Ok((store, raw)),
        Err(e) => {
            tracing::error!(error = %e, "Client bring-up failed, releasing handles");
            store.close().await;
            raw.release().await;
            Err(e)
        }
    }
}

/// Open a store without probing, resetting or migrating.
pub async fn new_client_with_driver<D: Driver>(driver: &D) -> Result<(D::Store, D::Raw)> {
    driver.connect(&[]).map_err(|e| Error::Connect(Box::new(e)))
}

async fn bring_up<D: Driver>(config: &mut ClientConfig<D>, store: &D::Store) -> Result<()> {
    let readiness = config.readiness;
    wait_for_ping(ping_store(store), readiness.timeout, readiness.interval)
        .await
        .map_err(|e| Error::UnreachableStore(Box::new(e)))?;
    tracing::info!("Database is reachable");

    if config.reset_on_conn {
        if !config.environment.is_test() {
            return Err(Error::EnvironmentGuardViolation);
        }

        tracing::warn!(schema = %config.reset.schema, "Resetting schema");
        let statements = config.reset.statements(Dialect::Postgres);
        SqlExecutor::new(store).execute_batch(&statements).await?;
    }

    if let Some(migrations) = config.migrations.as_mut() {
        if !migrations.is_empty() {
            migrations.execute(store).await?;
            if let Some(group) = migrations.report() {
                tracing::info!(
                    group_id = group.id,
                    applied = group.len(),
                    "Migrations up to date"
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn environment_marker() {
        assert_eq!(Environment::from_value(Some("test")), Environment::Test);
        assert_eq!(Environment::from_value(Some("TEST")), Environment::Other);
        assert_eq!(Environment::from_value(Some("production")), Environment::Other);
        assert_eq!(Environment::from_value(None), Environment::Other);
    }

    #[test]
    fn reset_statements_are_quoted() {
        let reset = ResetTarget {
            schema: "it_tests".to_string(),
            role: "ci".to_string(),
        };
        assert_eq!(
            reset.statements(Dialect::Postgres),
            vec![
                "DROP SCHEMA IF EXISTS \"it_tests\" CASCADE".to_string(),
                "CREATE SCHEMA IF NOT EXISTS \"it_tests\"".to_string(),
                "GRANT ALL ON SCHEMA \"it_tests\" TO \"ci\"".to_string(),
            ]
        );
    }

    #[test]
    fn computed_options_put_discard_first() {
        let config = ClientConfig::new(crate::testing::MemoryDriver::default())
            .with_option(ClientOption::MaxConnections(3))
            .discard_unknown_columns(true);
        assert_eq!(
            config.computed_options(),
            vec![ClientOption::DiscardUnknownColumns, ClientOption::MaxConnections(3)]
        );
    }
}
