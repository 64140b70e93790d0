//! In-memory store and driver for tests
//!
//! [`MemoryStore`] keeps control tables in memory, buffers transactional work
//! until commit, and counts pings and handle releases so lifecycle behavior can
//! be asserted without a running server. Failures are injected per statement
//! pattern or per ping.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::db::connection::ClientOption;
use crate::db::driver::Driver;
use crate::db::migrations::MigrationRecord;
use crate::db::normalize::normalize;
use crate::db::store::{RawHandle, Store, StoreTransaction};
use crate::error::{Error, Result};

#[derive(Debug)]
struct FakeDatabaseError {
    code: String,
    message: String,
}

impl fmt::Display for FakeDatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for FakeDatabaseError {}

impl sqlx::error::DatabaseError for FakeDatabaseError {
    fn message(&self) -> &str {
        &self.message
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(&self.code))
    }

    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        match self.code.as_str() {
            "23505" => sqlx::error::ErrorKind::UniqueViolation,
            "23503" => sqlx::error::ErrorKind::ForeignKeyViolation,
            "23502" => sqlx::error::ErrorKind::NotNullViolation,
            "23514" => sqlx::error::ErrorKind::CheckViolation,
            _ => sqlx::error::ErrorKind::Other,
        }
    }
}

/// A database error carrying a SQLSTATE code, as the server would return it.
pub fn db_error(code: &str, message: &str) -> sqlx::Error {
    sqlx::Error::Database(Box::new(FakeDatabaseError {
        code: code.to_string(),
        message: message.to_string(),
    }))
}

fn unreachable_error() -> Error {
    Error::Sqlx(sqlx::Error::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "connection refused",
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PingFailures {
    #[default]
    None,
    Next(usize),
    Always,
}

#[derive(Debug, Clone)]
struct StatementFailure {
    pattern: String,
    code: String,
    message: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    executed: Vec<String>,
    tables: HashMap<String, BTreeMap<i64, MigrationRecord>>,
    statement_failures: Vec<StatementFailure>,
    ping_failures: PingFailures,
    pings: usize,
    close_calls: usize,
    raw_releases: usize,
}

impl MemoryState {
    fn check_statement(&self, sql: &str) -> Result<()> {
        match self.statement_failures.iter().find(|f| sql.contains(&f.pattern)) {
            Some(failure) => Err(normalize(db_error(&failure.code, &failure.message))),
            None => Ok(()),
        }
    }
}

/// Shared in-memory store. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` pings.
    pub fn fail_pings(&self, count: usize) {
        self.state().ping_failures = PingFailures::Next(count);
    }

    /// Fail every ping from now on.
    pub fn fail_all_pings(&self) {
        self.state().ping_failures = PingFailures::Always;
    }

    /// Fail any statement containing `pattern` with the given SQLSTATE.
    pub fn fail_statements_matching(&self, pattern: &str, code: &str, message: &str) {
        self.state().statement_failures.push(StatementFailure {
            pattern: pattern.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.statement_failures.clear();
        state.ping_failures = PingFailures::None;
    }

    /// Successfully executed statements, in order. Transactional statements
    /// appear once their transaction commits.
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Rows of a control table, ordered by version.
    pub fn records(&self, table: &str) -> Vec<MigrationRecord> {
        self.state()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state().tables.contains_key(table)
    }

    pub fn pings(&self) -> usize {
        self.state().pings
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    pub fn raw_releases(&self) -> usize {
        self.state().raw_releases
    }

    /// The raw handle paired with this store.
    pub fn raw(&self) -> MemoryPool {
        MemoryPool {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        let mut state = self.state();
        state.pings += 1;
        match state.ping_failures {
            PingFailures::None => Ok(()),
            PingFailures::Always => Err(unreachable_error()),
            PingFailures::Next(0) => {
                state.ping_failures = PingFailures::None;
                Ok(())
            }
            PingFailures::Next(remaining) => {
                state.ping_failures = PingFailures::Next(remaining - 1);
                Err(unreachable_error())
            }
        }
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut state = self.state();
        state.check_statement(sql)?;
        state.executed.push(sql.to_string());
        Ok(0)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            statements: Vec::new(),
            writes: Vec::new(),
        }))
    }

    async fn create_control_table(&self, table: &str) -> Result<()> {
        self.state().tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn applied_migrations(&self, table: &str) -> Result<Vec<MigrationRecord>> {
        Ok(self.records(table))
    }

    async fn close(&self) {
        self.state().close_calls += 1;
    }
}

enum Write {
    Insert(String, MigrationRecord),
    Delete(String, i64),
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    statements: Vec<String>,
    writes: Vec<Write>,
}

impl MemoryTransaction {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending_insert(&self, table: &str, version: i64) -> bool {
        self.writes.iter().any(|write| {
            matches!(write, Write::Insert(t, record) if t == table && record.version == version)
        })
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.state().check_statement(sql)?;
        self.statements.push(sql.to_string());
        Ok(0)
    }

    async fn insert_migration(&mut self, table: &str, record: &MigrationRecord) -> Result<()> {
        let exists = self
            .state()
            .tables
            .get(table)
            .map_or(false, |rows| rows.contains_key(&record.version));
        if exists || self.pending_insert(table, record.version) {
            return Err(normalize(db_error(
                "23505",
                &format!("duplicate key value violates unique constraint \"{}_pkey\"", table),
            )));
        }

        self.writes.push(Write::Insert(table.to_string(), record.clone()));
        Ok(())
    }

    async fn delete_migration(&mut self, table: &str, version: i64) -> Result<u64> {
        let exists = self
            .state()
            .tables
            .get(table)
            .map_or(false, |rows| rows.contains_key(&version));
        self.writes.push(Write::Delete(table.to_string(), version));
        Ok(u64::from(exists))
    }

    async fn commit(&mut self) -> Result<()> {
        let statements = std::mem::take(&mut self.statements);
        let writes = std::mem::take(&mut self.writes);

        let mut state = self.state();
        state.executed.extend(statements);
        for write in writes {
            match write {
                Write::Insert(table, record) => {
                    state.tables.entry(table).or_default().insert(record.version, record);
                }
                Write::Delete(table, version) => {
                    if let Some(rows) = state.tables.get_mut(&table) {
                        rows.remove(&version);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.statements.clear();
        self.writes.clear();
        Ok(())
    }
}

/// Raw handle of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryPool {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl RawHandle for MemoryPool {
    async fn release(&self) {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .raw_releases += 1;
    }
}

/// Driver handing out a shared [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: MemoryStore,
    failure: Option<String>,
    connects: Arc<Mutex<Vec<Vec<ClientOption>>>>,
}

impl MemoryDriver {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// A driver whose `connect` always fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Options passed to each `connect` call, in order.
    pub fn connects(&self) -> Vec<Vec<ClientOption>> {
        self.connects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Driver for MemoryDriver {
    type Store = MemoryStore;
    type Raw = MemoryPool;

    fn connect(&self, options: &[ClientOption]) -> Result<(MemoryStore, MemoryPool)> {
        self.connects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(options.to_vec());

        if let Some(message) = &self.failure {
            return Err(Error::Config(message.clone()));
        }

        Ok((self.store.clone(), self.store.raw()))
    }
}
