//! Database connection handling
//!
//! [`Database`] is the high-level store handle produced by the PostgreSQL
//! drivers. It shares its sqlx pool with the raw handle returned next to it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Executor, PgPool, Postgres, Row, Transaction};

use crate::db::migrations::{ControlTable, MigrationRecord};
use crate::db::normalize::ErrorNormalizer;
use crate::db::store::{RawHandle, Store, StoreTransaction};
use crate::error::{Error, Result};
use crate::utils::naming;

/// SQL dialect of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Postgres,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
        }
    }

    /// Quote an identifier for use in generated SQL.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres => naming::quote_ident(ident),
        }
    }

    /// Bind parameter placeholder, 1-based.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
        }
    }
}

/// Options applied when building the high-level client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOption {
    /// Ignore result columns that have no matching field instead of failing.
    DiscardUnknownColumns,
    MaxConnections(u32),
    MinConnections(u32),
    AcquireTimeout(Duration),
    IdleTimeout(Duration),
    /// Marker string identifying missing-relation errors.
    MissingRelationMarker(String),
}

/// Client behavior resolved from driver settings and [`ClientOption`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSettings {
    pub discard_unknown_columns: bool,
    /// Send statements without server-side preparation.
    pub prefer_simple_protocol: bool,
    pub missing_relation_marker: Option<String>,
}

/// Wire protocol used for one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    /// Unprepared text query. Takes no arguments and may hold several statements.
    Simple,
    /// Parse, bind and execute. `persistent` keeps the prepared statement cached.
    Extended { persistent: bool },
}

impl ClientSettings {
    /// Unbound SQL always goes out as a simple query so multi-statement
    /// migration files work with either driver. Bound statements are only
    /// cached server-side when the simple protocol is not preferred.
    pub(crate) fn protocol(&self, bound: bool) -> Protocol {
        if bound {
            Protocol::Extended {
                persistent: !self.prefer_simple_protocol,
            }
        } else {
            Protocol::Simple
        }
    }
}

/// Fold client options over pool options, returning the client settings they
/// imply. Later options override earlier ones.
pub fn apply_client_options(
    base: PgPoolOptions,
    mut settings: ClientSettings,
    options: &[ClientOption],
) -> (PgPoolOptions, ClientSettings) {
    let pool = options.iter().fold(base, |pool, option| match option {
        ClientOption::DiscardUnknownColumns => {
            settings.discard_unknown_columns = true;
            pool
        }
        ClientOption::MaxConnections(max) => pool.max_connections(*max),
        ClientOption::MinConnections(min) => pool.min_connections(*min),
        ClientOption::AcquireTimeout(timeout) => pool.acquire_timeout(*timeout),
        ClientOption::IdleTimeout(timeout) => pool.idle_timeout(*timeout),
        ClientOption::MissingRelationMarker(marker) => {
            settings.missing_relation_marker = Some(marker.clone());
            pool
        }
    });

    (pool, settings)
}

const RECORD_COLUMNS: [&str; 4] = ["version", "name", "group_id", "applied_at"];

/// First result column that does not map onto a [`MigrationRecord`] field.
fn unknown_column<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    names.into_iter().find(|name| !RECORD_COLUMNS.contains(name))
}

/// Reject unknown columns unless they are to be discarded.
fn check_record_columns<'a>(names: impl IntoIterator<Item = &'a str>, discard_unknown: bool) -> Result<()> {
    if discard_unknown {
        return Ok(());
    }
    match unknown_column(names) {
        Some(column) => Err(Error::Serialization(format!(
            "MigrationRecord does not have column {:?}",
            column
        ))),
        None => Ok(()),
    }
}

/// High-level PostgreSQL store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    dialect: Dialect,
    settings: ClientSettings,
    normalizer: ErrorNormalizer,
}

impl Database {
    pub fn new(pool: PgPool, settings: ClientSettings) -> Self {
        let normalizer = match &settings.missing_relation_marker {
            Some(marker) => ErrorNormalizer::new().with_missing_relation_marker(marker.clone()),
            None => ErrorNormalizer::new(),
        };

        Self {
            pool,
            dialect: Dialect::Postgres,
            settings,
            normalizer,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn control_table<'a>(&self, table: &'a str) -> ControlTable<'a> {
        ControlTable::new(table, self.dialect)
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<PgRow>> {
        let rows = match self.settings.protocol(false) {
            Protocol::Simple => self.pool.fetch_all(sql).await,
            Protocol::Extended { persistent } => {
                sqlx::query(sql).persistent(persistent).fetch_all(&self.pool).await
            }
        };
        rows.map_err(|e| self.normalizer.normalize(e))
    }

    fn decode_record(&self, row: &PgRow) -> Result<MigrationRecord> {
        check_record_columns(
            row.columns().iter().map(|column| column.name()),
            self.settings.discard_unknown_columns,
        )?;

        let decode = |e| self.normalizer.normalize(e);
        Ok(MigrationRecord {
            version: row.try_get::<i64, _>("version").map_err(decode)?,
            name: row.try_get::<String, _>("name").map_err(decode)?,
            group_id: row.try_get::<i64, _>("group_id").map_err(decode)?,
            applied_at: row.try_get::<DateTime<Utc>, _>("applied_at").map_err(decode)?,
        })
    }
}

#[async_trait]
impl Store for Database {
    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| self.normalizer.normalize(e))?;
        sqlx::Connection::ping(&mut *conn)
            .await
            .map_err(|e| self.normalizer.normalize(e))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let result = match self.settings.protocol(false) {
            Protocol::Simple => self.pool.execute(sql).await,
            Protocol::Extended { persistent } => {
                sqlx::query(sql).persistent(persistent).execute(&self.pool).await
            }
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|e| self.normalizer.normalize(e))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.normalizer.normalize(e))?;
        Ok(Box::new(PgTransaction {
            tx: Some(tx),
            dialect: self.dialect,
            settings: self.settings.clone(),
            normalizer: self.normalizer.clone(),
        }))
    }

    async fn create_control_table(&self, table: &str) -> Result<()> {
        self.execute(&self.control_table(table).create_sql()).await?;
        Ok(())
    }

    async fn applied_migrations(&self, table: &str) -> Result<Vec<MigrationRecord>> {
        let rows = self.fetch_all(&self.control_table(table).select_sql()).await?;
        rows.iter().map(|row| self.decode_record(row)).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// A PostgreSQL transaction opened by [`Database::begin`].
pub struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    dialect: Dialect,
    settings: ClientSettings,
    normalizer: ErrorNormalizer,
}

impl PgTransaction {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or_else(|| {
            Error::Sqlx(sqlx::Error::Protocol("transaction already finished".to_string()))
        })
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let protocol = self.settings.protocol(false);
        let normalizer = self.normalizer.clone();
        let tx = self.open()?;

        let result = match protocol {
            Protocol::Simple => (&mut **tx).execute(sql).await,
            Protocol::Extended { persistent } => {
                sqlx::query(sql).persistent(persistent).execute(&mut **tx).await
            }
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|e| normalizer.normalize(e))
    }

    async fn insert_migration(&mut self, table: &str, record: &MigrationRecord) -> Result<()> {
        let sql = ControlTable::new(table, self.dialect).insert_sql();
        let persistent = matches!(
            self.settings.protocol(true),
            Protocol::Extended { persistent: true }
        );
        let normalizer = self.normalizer.clone();
        let tx = self.open()?;

        sqlx::query(&sql)
            .bind(record.version)
            .bind(&record.name)
            .bind(record.group_id)
            .bind(record.applied_at)
            .persistent(persistent)
            .execute(&mut **tx)
            .await
            .map_err(|e| normalizer.normalize(e))?;
        Ok(())
    }

    async fn delete_migration(&mut self, table: &str, version: i64) -> Result<u64> {
        let sql = ControlTable::new(table, self.dialect).delete_sql();
        let persistent = matches!(
            self.settings.protocol(true),
            Protocol::Extended { persistent: true }
        );
        let normalizer = self.normalizer.clone();
        let tx = self.open()?;

        sqlx::query(&sql)
            .bind(version)
            .persistent(persistent)
            .execute(&mut **tx)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| normalizer.normalize(e))
    }

    async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(|e| self.normalizer.normalize(e)),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(|e| self.normalizer.normalize(e)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RawHandle for PgPool {
    async fn release(&self) {
        sqlx::Pool::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dialect_quoting() {
        assert_eq!(Dialect::Postgres.quote_ident("test"), "\"test\"");
        assert_eq!(Dialect::Postgres.quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
    }

    #[test]
    fn client_options_fold_in_order() {
        let (pool, settings) = apply_client_options(
            PgPoolOptions::new(),
            ClientSettings::default(),
            &[
                ClientOption::MaxConnections(4),
                ClientOption::DiscardUnknownColumns,
                ClientOption::MaxConnections(8),
                ClientOption::AcquireTimeout(Duration::from_secs(3)),
                ClientOption::MissingRelationMarker("APP=NOREF".to_string()),
            ],
        );

        assert_eq!(pool.get_max_connections(), 8);
        assert_eq!(pool.get_acquire_timeout(), Duration::from_secs(3));
        assert!(settings.discard_unknown_columns);
        assert!(!settings.prefer_simple_protocol);
        assert_eq!(settings.missing_relation_marker.as_deref(), Some("APP=NOREF"));
    }

    #[test]
    fn unbound_sql_is_never_prepared() {
        let extended = ClientSettings::default();
        let simple = ClientSettings {
            prefer_simple_protocol: true,
            ..ClientSettings::default()
        };

        assert_eq!(extended.protocol(false), Protocol::Simple);
        assert_eq!(simple.protocol(false), Protocol::Simple);
        assert_eq!(extended.protocol(true), Protocol::Extended { persistent: true });
        assert_eq!(simple.protocol(true), Protocol::Extended { persistent: false });
    }

    #[test]
    fn unknown_record_columns() {
        let known = ["version", "name", "group_id", "applied_at"];
        assert_eq!(unknown_column(known), None);
        assert_eq!(unknown_column(["version", "checksum", "name"]), Some("checksum"));

        let err = check_record_columns(["version", "checksum"], false).unwrap_err();
        assert!(matches!(&err, Error::Serialization(message) if message.contains("checksum")));
        assert!(check_record_columns(["version", "checksum"], true).is_ok());
        assert!(check_record_columns(known, false).is_ok());
    }
}
