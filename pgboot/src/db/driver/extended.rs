//! Extended-protocol driver built from a DSN

use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};

use crate::db::connection::{apply_client_options, ClientOption, ClientSettings, Database};
use crate::db::driver::Driver;
use crate::error::Result;

/// Log statements slower than `threshold_ms` at `level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SlowStatementLog {
    pub level: LevelFilter,
    pub threshold_ms: u64,
}

impl SlowStatementLog {
    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }
}

/// Driver that parses a DSN and can use prepared statements.
///
/// Implicitly prepared statements are disabled unless
/// `keep_implicit_prepared_statements` is set, so by default it behaves like
/// the simple-protocol driver on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtendedDriver {
    pub dsn: String,
    pub keep_implicit_prepared_statements: bool,
    pub log_level: Option<LevelFilter>,
    pub slow_statement_log: Option<SlowStatementLog>,
    pub statement_cache_capacity: Option<usize>,
}

impl ExtendedDriver {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Self::default()
        }
    }

    pub fn keep_implicit_prepared_statements(mut self, keep: bool) -> Self {
        self.keep_implicit_prepared_statements = keep;
        self
    }

    /// Parse the DSN and apply protocol and logging overrides.
    pub fn connect_options(&self) -> Result<(PgConnectOptions, ClientSettings)> {
        let mut options = PgConnectOptions::from_str(&self.dsn)?;
        let mut settings = ClientSettings::default();

        if !self.keep_implicit_prepared_statements {
            options = options.statement_cache_capacity(0);
            settings.prefer_simple_protocol = true;
        }

        if let Some(level) = self.log_level {
            options = options.log_statements(level);
        }
        if let Some(slow) = self.slow_statement_log {
            options = options.log_slow_statements(slow.level, slow.threshold());
        }
        if let Some(capacity) = self.statement_cache_capacity {
            options = options.statement_cache_capacity(capacity);
        }

        Ok((options, settings))
    }
}

impl Driver for ExtendedDriver {
    type Store = Database;
    type Raw = PgPool;

    fn connect(&self, options: &[ClientOption]) -> Result<(Database, PgPool)> {
        let (connect, settings) = self.connect_options()?;
        let (pool_options, settings) = apply_client_options(PgPoolOptions::new(), settings, options);
        let pool = pool_options.connect_lazy_with(connect);

        tracing::debug!(
            driver = "extended",
            simple_protocol = settings.prefer_simple_protocol,
            "Opened lazy connection pool"
        );
        Ok((Database::new(pool.clone(), settings), pool))
    }
}
