//! Migration management
//!
//! A [`MigrationSet`] collects SQL file sources and procedural migrations,
//! discovers them into a version-ordered plan, and applies or rolls them back
//! against a [`Store`]. The control table in the migrated store is the only
//! durable state: a row exists exactly when its migration is applied.
//!
//! Concurrent runs from several processes are not coordinated beyond what the
//! store's transaction isolation gives the control table.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::db::connection::Dialect;
use crate::db::store::{Store, StoreTransaction};
use crate::error::{Error, Result};

/// Default name of the control table.
pub const DEFAULT_CONTROL_TABLE: &str = "pgboot_migrations";

const FILE_NAME_PATTERN: &str = r"^(\d+)_([0-9A-Za-z_\-]+)(\.notx)?\.(up|down)\.sql$";

/// A row of the control table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    /// Identifies the `execute` call that applied this migration.
    pub group_id: i64,
    pub applied_at: DateTime<Utc>,
}

/// Records touched by the most recent `execute` or `rollback`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MigrationGroup {
    /// Group id of the affected records, 0 when nothing was affected.
    pub id: i64,
    pub migrations: Vec<MigrationRecord>,
}

impl MigrationGroup {
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn versions(&self) -> Vec<i64> {
        self.migrations.iter().map(|record| record.version).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.migrations.iter()
    }
}

/// SQL for the control table, rendered for a dialect.
#[derive(Debug, Clone)]
pub struct ControlTable<'a> {
    name: &'a str,
    dialect: Dialect,
}

impl<'a> ControlTable<'a> {
    pub fn new(name: &'a str, dialect: Dialect) -> Self {
        Self { name, dialect }
    }

    fn table(&self) -> String {
        self.dialect.quote_ident(self.name)
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
            version BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            group_id BIGINT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
            self.table()
        )
    }

    pub fn select_sql(&self) -> String {
        format!(
            "SELECT * FROM {} ORDER BY version",
            self.table()
        )
    }

    pub fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, name, group_id, applied_at) VALUES ({}, {}, {}, {})",
            self.table(),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
            self.dialect.placeholder(3),
            self.dialect.placeholder(4),
        )
    }

    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE version = {}",
            self.table(),
            self.dialect.placeholder(1)
        )
    }
}

/// The transaction handed to a migration's up or down function.
pub struct MigrationTx {
    inner: Box<dyn StoreTransaction>,
}

impl MigrationTx {
    async fn begin<S: Store + ?Sized>(store: &S) -> Result<Self> {
        Ok(Self {
            inner: store.begin().await?,
        })
    }

    /// Execute a statement inside the migration's transaction.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.inner.execute(sql).await
    }

    async fn commit(mut self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(mut self) {
        if let Err(e) = self.inner.rollback().await {
            tracing::warn!(error = %e, "Failed to roll back migration transaction");
        }
    }
}

/// Signature of a procedural migration step.
///
/// The [`macro@crate::migration`] attribute produces functions of this shape
/// from an `async fn`.
pub type MigrationFn =
    Arc<dyn for<'a> Fn(&'a mut MigrationTx) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// A migration written as Rust functions.
#[derive(Clone)]
pub struct ProceduralMigration {
    version: i64,
    name: String,
    up: MigrationFn,
    down: Option<MigrationFn>,
}

impl ProceduralMigration {
    pub fn new<F>(version: i64, name: impl Into<String>, up: F) -> Self
    where
        F: for<'a> Fn(&'a mut MigrationTx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        Self {
            version,
            name: name.into(),
            up: Arc::new(up),
            down: None,
        }
    }

    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: for<'a> Fn(&'a mut MigrationTx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.down = Some(Arc::new(down));
        self
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ProceduralMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProceduralMigration")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("has_down", &self.down.is_some())
            .finish()
    }
}

/// Where SQL migration files come from.
///
/// Files are named `<version>_<name>.up.sql` with an optional matching
/// `.down.sql`. A `.notx.up.sql` suffix runs the migration outside a
/// transaction. Other files are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlSource {
    /// A directory, scanned recursively.
    Dir(PathBuf),
    /// Files bundled into the binary, typically with `include_str!`.
    Embedded {
        label: String,
        files: Vec<(String, String)>,
    },
}

impl SqlSource {
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        SqlSource::Dir(path.into())
    }

    pub fn embedded(label: impl Into<String>, files: &[(&str, &str)]) -> Self {
        SqlSource::Embedded {
            label: label.into(),
            files: files
                .iter()
                .map(|(name, contents)| (name.to_string(), contents.to_string()))
                .collect(),
        }
    }

    fn describe(&self) -> String {
        match self {
            SqlSource::Dir(path) => path.display().to_string(),
            SqlSource::Embedded { label, .. } => label.clone(),
        }
    }

    /// `(file name, contents)` of every candidate `.sql` file.
    fn read_files(&self, label: &str) -> Result<Vec<(String, String)>> {
        match self {
            SqlSource::Embedded { files, .. } => Ok(files.clone()),
            SqlSource::Dir(root) => {
                if !root.is_dir() {
                    return Err(Error::discovery(label, "not a directory"));
                }

                let mut files = Vec::new();
                for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
                    let entry = entry.map_err(|e| Error::discovery(label, e.to_string()))?;
                    let path = entry.path();
                    if !path.is_file() || !has_sql_extension(path) {
                        continue;
                    }

                    let file_name = entry.file_name().to_string_lossy().into_owned();
                    let contents = std::fs::read_to_string(path).map_err(|e| {
                        Error::discovery(label, format!("failed to read {}: {}", path.display(), e))
                    })?;
                    files.push((file_name, contents));
                }
                Ok(files)
            }
        }
    }
}

fn has_sql_extension(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "sql")
}

#[derive(Clone)]
enum MigrationSource {
    Sql(SqlSource),
    Procedural(ProceduralMigration),
}

#[derive(Clone)]
enum Body {
    Sql {
        up: String,
        down: Option<String>,
        transactional: bool,
    },
    Procedural {
        up: MigrationFn,
        down: Option<MigrationFn>,
    },
}

/// A discovered migration, ready to run.
#[derive(Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    /// Label of the source it was discovered in.
    pub source: String,
    body: Body,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("source", &self.source)
            .field("transactional", &self.is_transactional())
            .finish()
    }
}

impl Migration {
    pub fn is_procedural(&self) -> bool {
        matches!(self.body, Body::Procedural { .. })
    }

    pub fn is_transactional(&self) -> bool {
        match &self.body {
            Body::Sql { transactional, .. } => *transactional,
            Body::Procedural { .. } => true,
        }
    }

    pub fn has_down(&self) -> bool {
        match &self.body {
            Body::Sql { down, .. } => down.is_some(),
            Body::Procedural { down, .. } => down.is_some(),
        }
    }

    async fn run_up(&self, tx: &mut MigrationTx) -> Result<()> {
        match &self.body {
            Body::Sql { up, .. } => tx.execute(up).await.map(|_| ()),
            Body::Procedural { up, .. } => up(tx).await,
        }
    }

    async fn run_down(&self, tx: &mut MigrationTx) -> Result<()> {
        match &self.body {
            Body::Sql { down: Some(sql), .. } => tx.execute(sql).await.map(|_| ()),
            Body::Procedural { down: Some(down), .. } => down(tx).await,
            _ => {
                tracing::warn!(
                    version = self.version,
                    name = %self.name,
                    "No down migration, only removing the control-table record"
                );
                Ok(())
            }
        }
    }
}

/// Which applied migrations a rollback reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTarget {
    /// The `n` most recently applied migrations.
    Steps(usize),
    /// Every migration applied by the most recent `execute` call.
    LastGroup,
    /// Every migration whose version is above the given one.
    ToVersion(i64),
}

impl Default for RollbackTarget {
    fn default() -> Self {
        RollbackTarget::Steps(1)
    }
}

/// A discovered migration that has not been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: i64,
    pub name: String,
    pub source: String,
}

/// Applied and pending migrations, as seen by [`MigrationSet::status`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<PendingMigration>,
}

/// Ordered, append-only collection of migration sources.
///
/// Registration and execution both take `&mut self`, so sources cannot be
/// added while a run is in progress.
#[derive(Clone)]
pub struct MigrationSet {
    sources: Vec<MigrationSource>,
    table: String,
    last_group: Option<MigrationGroup>,
}

impl Default for MigrationSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MigrationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationSet")
            .field("sources", &self.sources.len())
            .field("table", &self.table)
            .field("last_group", &self.last_group)
            .finish()
    }
}

impl MigrationSet {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            table: DEFAULT_CONTROL_TABLE.to_string(),
            last_group: None,
        }
    }

    /// Use a different control table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn with_sql(mut self, source: SqlSource) -> Self {
        self.register_sql([source]);
        self
    }

    pub fn with_procedural(mut self, migration: ProceduralMigration) -> Self {
        self.register_procedural([migration]);
        self
    }

    /// Append SQL file sources.
    pub fn register_sql(&mut self, sources: impl IntoIterator<Item = SqlSource>) {
        self.sources
            .extend(sources.into_iter().map(MigrationSource::Sql));
    }

    /// Append procedural migrations.
    pub fn register_procedural(&mut self, migrations: impl IntoIterator<Item = ProceduralMigration>) {
        self.sources
            .extend(migrations.into_iter().map(MigrationSource::Procedural));
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Result of the last `execute` or `rollback`. `None` before the first
    /// call and after a call that failed before affecting any migration.
    pub fn report(&self) -> Option<&MigrationGroup> {
        self.last_group.as_ref()
    }

    /// Scan every source and return all migrations ordered by version.
    pub fn discover(&self) -> Result<Vec<Migration>> {
        let mut discovered: BTreeMap<i64, Migration> = BTreeMap::new();
        let mut sql_index = 0;
        let mut procedural_index = 0;

        for source in &self.sources {
            let found = match source {
                MigrationSource::Sql(sql) => {
                    let label = format!("filesystem {} ({})", sql_index, sql.describe());
                    sql_index += 1;
                    discover_sql(sql, &label)?
                }
                MigrationSource::Procedural(migration) => {
                    let label = format!("procedural migration {} ({})", procedural_index, migration.name);
                    procedural_index += 1;
                    vec![discover_procedural(migration, &label)?]
                }
            };

            for migration in found {
                if let Some(existing) = discovered.get(&migration.version) {
                    return Err(Error::discovery(
                        migration.source.clone(),
                        format!(
                            "duplicate version {} ({} conflicts with {} from {})",
                            migration.version, migration.name, existing.name, existing.source
                        ),
                    ));
                }
                discovered.insert(migration.version, migration);
            }
        }

        Ok(discovered.into_values().collect())
    }

    /// Applied and pending migrations.
    pub async fn status<S: Store + ?Sized>(&self, store: &S) -> Result<MigrationStatus> {
        let migrations = self.discover()?;
        store.create_control_table(&self.table).await?;
        let applied = store.applied_migrations(&self.table).await?;

        let pending = pending_migrations(&migrations, &applied)
            .into_iter()
            .map(|migration| PendingMigration {
                version: migration.version,
                name: migration.name.clone(),
                source: migration.source.clone(),
            })
            .collect();

        Ok(MigrationStatus { applied, pending })
    }

    /// Apply every pending migration. See [`MigrationSet::execute_on`].
    pub async fn execute<S: Store + ?Sized>(&mut self, store: &S) -> Result<()> {
        self.execute_on(Some(store)).await
    }

    /// Apply, in increasing version order, every discovered migration above
    /// the highest applied version.
    ///
    /// Each migration commits together with its control-table row. The run
    /// stops at the first failure; migrations committed before it stay
    /// applied and the next call resumes from the failed one. Calling it
    /// again with nothing pending yields an empty group.
    pub async fn execute_on<S: Store + ?Sized>(&mut self, store: Option<&S>) -> Result<()> {
        let store = store.ok_or(Error::MissingStore)?;
        self.last_group = None;

        let migrations = self.discover()?;
        store.create_control_table(&self.table).await?;
        let applied = store.applied_migrations(&self.table).await?;

        let pending = pending_migrations(&migrations, &applied);
        if pending.is_empty() {
            tracing::info!(table = %self.table, "No pending migrations");
            self.last_group = Some(MigrationGroup::default());
            return Ok(());
        }

        let group_id = applied.iter().map(|record| record.group_id).max().unwrap_or(0) + 1;
        let mut group = MigrationGroup {
            id: group_id,
            migrations: Vec::with_capacity(pending.len()),
        };

        for migration in pending {
            tracing::info!(
                version = migration.version,
                name = %migration.name,
                source = %migration.source,
                "Applying migration"
            );

            match apply(store, &self.table, migration, group_id).await {
                Ok(record) => {
                    tracing::info!(version = migration.version, "Migration applied successfully");
                    group.migrations.push(record);
                }
                Err(e) => {
                    tracing::error!(version = migration.version, error = %e, "Migration failed");
                    if !group.is_empty() {
                        self.last_group = Some(group);
                    }
                    return Err(Error::Migration {
                        version: migration.version,
                        name: migration.name.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }

        self.last_group = Some(group);
        Ok(())
    }

    /// Reverse applied migrations. See [`MigrationSet::rollback_on`].
    pub async fn rollback<S: Store + ?Sized>(&mut self, store: &S, target: RollbackTarget) -> Result<()> {
        self.rollback_on(Some(store), target).await
    }

    /// Reverse the migrations selected by `target`, in strictly decreasing
    /// version order, deleting each control-table row with its reversal.
    pub async fn rollback_on<S: Store + ?Sized>(
        &mut self,
        store: Option<&S>,
        target: RollbackTarget,
    ) -> Result<()> {
        let store = store.ok_or(Error::MissingStore)?;
        self.last_group = None;

        let migrations = self.discover()?;
        store.create_control_table(&self.table).await?;
        let applied = store.applied_migrations(&self.table).await?;

        let selected = select_for_rollback(applied, target);
        if selected.is_empty() {
            tracing::info!(table = %self.table, "Nothing to roll back");
            self.last_group = Some(MigrationGroup::default());
            return Ok(());
        }

        let by_version: BTreeMap<i64, &Migration> =
            migrations.iter().map(|migration| (migration.version, migration)).collect();

        // Refuse before touching anything if a selected migration cannot be reversed.
        let mut plan = Vec::with_capacity(selected.len());
        for record in selected {
            match by_version.get(&record.version) {
                Some(migration) => plan.push((record, *migration)),
                None => {
                    return Err(Error::MigrationPlan(format!(
                        "applied migration {} ({}) is not registered and cannot be rolled back",
                        record.version, record.name
                    )))
                }
            }
        }

        let mut group = MigrationGroup {
            id: plan[0].0.group_id,
            migrations: Vec::with_capacity(plan.len()),
        };

        for (record, migration) in plan {
            tracing::info!(version = record.version, name = %record.name, "Rolling back migration");

            if let Err(e) = revert(store, &self.table, migration).await {
                tracing::error!(version = record.version, error = %e, "Rollback failed");
                if !group.is_empty() {
                    self.last_group = Some(group);
                }
                return Err(Error::Migration {
                    version: record.version,
                    name: record.name,
                    source: Box::new(e),
                });
            }

            group.migrations.push(record);
        }

        self.last_group = Some(group);
        Ok(())
    }
}

fn discover_sql(source: &SqlSource, label: &str) -> Result<Vec<Migration>> {
    struct Pair {
        name: String,
        up: Option<(String, bool)>,
        down: Option<String>,
    }

    let file_name_pattern = Regex::new(FILE_NAME_PATTERN)
        .map_err(|e| Error::discovery(label, format!("invalid file name pattern: {}", e)))?;
    let mut pairs: BTreeMap<i64, Pair> = BTreeMap::new();

    for (file_name, contents) in source.read_files(label)? {
        if !file_name.ends_with(".up.sql") && !file_name.ends_with(".down.sql") {
            continue;
        }

        let captures = file_name_pattern.captures(&file_name).ok_or_else(|| {
            Error::discovery(
                label,
                format!("unsupported migration file name {:?}, expected <version>_<name>.up.sql", file_name),
            )
        })?;

        let version: i64 = captures[1].parse().map_err(|_| {
            Error::discovery(label, format!("version of {:?} does not fit in 64 bits", file_name))
        })?;
        let name = captures[2].to_string();
        let notx = captures.get(3).is_some();
        let is_up = &captures[4] == "up";

        let pair = pairs.entry(version).or_insert_with(|| Pair {
            name: name.clone(),
            up: None,
            down: None,
        });

        if pair.name != name {
            return Err(Error::discovery(
                label,
                format!("duplicate version {} ({} and {})", version, pair.name, name),
            ));
        }

        let slot_taken = if is_up { pair.up.is_some() } else { pair.down.is_some() };
        if slot_taken {
            return Err(Error::discovery(
                label,
                format!("duplicate {} file for version {}", if is_up { "up" } else { "down" }, version),
            ));
        }

        if is_up {
            pair.up = Some((contents, !notx));
        } else {
            pair.down = Some(contents);
        }
    }

    pairs
        .into_iter()
        .map(|(version, pair)| {
            let (up, transactional) = pair.up.ok_or_else(|| {
                Error::discovery(
                    label,
                    format!("down migration {}_{} has no up migration", version, pair.name),
                )
            })?;

            Ok(Migration {
                version,
                name: pair.name,
                source: label.to_string(),
                body: Body::Sql {
                    up,
                    down: pair.down,
                    transactional,
                },
            })
        })
        .collect()
}

fn discover_procedural(migration: &ProceduralMigration, label: &str) -> Result<Migration> {
    if migration.version < 0 {
        return Err(Error::discovery(label, "version must not be negative"));
    }
    if migration.name.trim().is_empty() {
        return Err(Error::discovery(label, "name must not be empty"));
    }

    Ok(Migration {
        version: migration.version,
        name: migration.name.clone(),
        source: label.to_string(),
        body: Body::Procedural {
            up: migration.up.clone(),
            down: migration.down.clone(),
        },
    })
}

/// Discovered migrations above the highest applied version.
fn pending_migrations<'m>(migrations: &'m [Migration], applied: &[MigrationRecord]) -> Vec<&'m Migration> {
    let highest = applied.iter().map(|record| record.version).max();
    let applied_versions: HashSet<i64> = applied.iter().map(|record| record.version).collect();

    migrations
        .iter()
        .filter(|migration| match highest {
            Some(highest) if migration.version <= highest => {
                if !applied_versions.contains(&migration.version) {
                    tracing::warn!(
                        version = migration.version,
                        name = %migration.name,
                        highest_applied = highest,
                        "Skipping unapplied migration below the highest applied version"
                    );
                }
                false
            }
            _ => true,
        })
        .collect()
}

fn select_for_rollback(mut applied: Vec<MigrationRecord>, target: RollbackTarget) -> Vec<MigrationRecord> {
    applied.sort_by(|a, b| b.version.cmp(&a.version));

    match target {
        RollbackTarget::Steps(steps) => applied.into_iter().take(steps).collect(),
        RollbackTarget::LastGroup => {
            let Some(last) = applied.iter().map(|record| record.group_id).max() else {
                return Vec::new();
            };
            applied
                .into_iter()
                .filter(|record| record.group_id == last)
                .collect()
        }
        RollbackTarget::ToVersion(version) => applied
            .into_iter()
            .filter(|record| record.version > version)
            .collect(),
    }
}

async fn apply<S: Store + ?Sized>(
    store: &S,
    table: &str,
    migration: &Migration,
    group_id: i64,
) -> Result<MigrationRecord> {
    let record = MigrationRecord {
        version: migration.version,
        name: migration.name.clone(),
        group_id,
        applied_at: Utc::now(),
    };

    if !migration.is_transactional() {
        if let Body::Sql { up, .. } = &migration.body {
            store.execute(up).await?;
        }
        let mut tx = MigrationTx::begin(store).await?;
        if let Err(e) = tx.inner.insert_migration(table, &record).await {
            tx.rollback().await;
            return Err(e);
        }
        tx.commit().await?;
        return Ok(record);
    }

    let mut tx = MigrationTx::begin(store).await?;
    let outcome = match migration.run_up(&mut tx).await {
        Ok(()) => tx.inner.insert_migration(table, &record).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            tx.commit().await?;
            Ok(record)
        }
        Err(e) => {
            tx.rollback().await;
            Err(e)
        }
    }
}

async fn revert<S: Store + ?Sized>(store: &S, table: &str, migration: &Migration) -> Result<()> {
    if !migration.is_transactional() {
        if let Body::Sql { down: Some(down), .. } = &migration.body {
            store.execute(down).await?;
        }
        let mut tx = MigrationTx::begin(store).await?;
        if let Err(e) = tx.inner.delete_migration(table, migration.version).await {
            tx.rollback().await;
            return Err(e);
        }
        return tx.commit().await;
    }

    let mut tx = MigrationTx::begin(store).await?;
    let outcome = match migration.run_down(&mut tx).await {
        Ok(()) => tx
            .inner
            .delete_migration(table, migration.version)
            .await
            .map(|_| ()),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => tx.commit().await,
        Err(e) => {
            tx.rollback().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).expect("write migration file");
    }

    fn insert_admin(tx: &mut MigrationTx) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tx.execute("INSERT INTO roles (name) VALUES ('admin')").await?;
            Ok(())
        })
    }

    fn delete_admin(tx: &mut MigrationTx) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tx.execute("DELETE FROM roles WHERE name = 'admin'").await?;
            Ok(())
        })
    }

    #[test]
    fn discovers_pairs_recursively_and_ignores_other_files() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        write(dir.path(), "0001_init.up.sql", "CREATE TABLE users (id INT)");
        write(dir.path(), "0001_init.down.sql", "DROP TABLE users");
        write(&dir.path().join("nested"), "0002_add_col.up.sql", "ALTER TABLE users ADD COLUMN email TEXT");
        write(dir.path(), "0003_index.notx.up.sql", "CREATE INDEX CONCURRENTLY users_email ON users (email)");
        write(dir.path(), "README.md", "not a migration");
        write(dir.path(), "seed.sql", "SELECT 1");

        let set = MigrationSet::new().with_sql(SqlSource::dir(dir.path()));
        let migrations = set.discover().unwrap();

        let versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(migrations[0].name, "init");
        assert!(migrations[0].has_down());
        assert!(!migrations[1].has_down());
        assert!(migrations[1].is_transactional());
        assert!(!migrations[2].is_transactional());
        assert!(migrations[0].source.starts_with("filesystem 0"));
    }

    #[test]
    fn rejects_malformed_names() {
        let set = MigrationSet::new().with_sql(SqlSource::embedded(
            "bundled",
            &[("init.up.sql", "CREATE TABLE t (id INT)")],
        ));
        let err = set.discover().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Discovery);
        assert!(err.to_string().contains("filesystem 0 (bundled)"));
    }

    #[test]
    fn rejects_down_without_up() {
        let set = MigrationSet::new().with_sql(SqlSource::embedded(
            "bundled",
            &[("0004_orphan.down.sql", "DROP TABLE t")],
        ));
        let err = set.discover().unwrap_err();
        assert!(err.to_string().contains("has no up migration"));
    }

    #[test]
    fn rejects_duplicate_versions_within_a_source() {
        let set = MigrationSet::new().with_sql(SqlSource::embedded(
            "bundled",
            &[
                ("0001_init.up.sql", "CREATE TABLE a (id INT)"),
                ("0001_other.up.sql", "CREATE TABLE b (id INT)"),
            ],
        ));
        assert_eq!(set.discover().unwrap_err().kind(), ErrorKind::Discovery);
    }

    #[test]
    fn rejects_duplicate_versions_across_sources() {
        let set = MigrationSet::new()
            .with_sql(SqlSource::embedded("first", &[("0001_init.up.sql", "SELECT 1")]))
            .with_procedural(ProceduralMigration::new(1, "seed", insert_admin));

        let err = set.discover().unwrap_err();
        match err {
            Error::Discovery { source_name, message } => {
                assert_eq!(source_name, "procedural migration 0 (seed)");
                assert!(message.contains("duplicate version 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_directory_is_a_discovery_error() {
        let set = MigrationSet::new().with_sql(SqlSource::dir("/definitely/not/here"));
        assert_eq!(set.discover().unwrap_err().kind(), ErrorKind::Discovery);
    }

    #[tokio::test]
    async fn missing_store_fails_immediately() {
        let mut set = MigrationSet::new().with_procedural(ProceduralMigration::new(1, "seed", insert_admin));

        let err = set.execute_on(None::<&MemoryStore>).await.unwrap_err();
        assert!(matches!(err, Error::MissingStore));

        let err = set
            .rollback_on(None::<&MemoryStore>, RollbackTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingStore));
        assert!(set.report().is_none());
    }

    #[tokio::test]
    async fn procedural_migrations_run_inside_their_transaction() {
        let store = MemoryStore::new();
        let mut set = MigrationSet::new()
            .with_procedural(ProceduralMigration::new(2, "seed_admin", insert_admin).with_down(delete_admin))
            .with_sql(SqlSource::embedded(
                "bundled",
                &[("0001_roles.up.sql", "CREATE TABLE roles (name TEXT)")],
            ));

        set.execute(&store).await.unwrap();
        assert_eq!(set.report().unwrap().versions(), vec![1, 2]);
        assert_eq!(
            store.executed(),
            vec![
                "CREATE TABLE roles (name TEXT)".to_string(),
                "INSERT INTO roles (name) VALUES ('admin')".to_string(),
            ]
        );

        set.rollback(&store, RollbackTarget::Steps(1)).await.unwrap();
        assert_eq!(store.executed().last().unwrap(), "DELETE FROM roles WHERE name = 'admin'");
        let remaining: Vec<i64> = store.records(set.table()).iter().map(|r| r.version).collect();
        assert_eq!(remaining, vec![1]);
    }

    #[tokio::test]
    async fn failed_migration_keeps_earlier_successes_and_resumes() {
        let store = MemoryStore::new();
        store.fail_statements_matching("ALTER TABLE", "42703", "column does not exist");

        let mut set = MigrationSet::new().with_sql(SqlSource::embedded(
            "bundled",
            &[
                ("0001_init.up.sql", "CREATE TABLE users (id INT)"),
                ("0002_add_col.up.sql", "ALTER TABLE users ADD COLUMN email TEXT"),
                ("0003_more.up.sql", "CREATE TABLE posts (id INT)"),
            ],
        ));

        let err = set.execute(&store).await.unwrap_err();
        assert!(matches!(err, Error::Migration { version: 2, .. }));
        assert_eq!(set.report().unwrap().versions(), vec![1]);
        assert_eq!(store.records(set.table()).len(), 1);
        assert_eq!(store.executed(), vec!["CREATE TABLE users (id INT)".to_string()]);

        store.clear_failures();
        set.execute(&store).await.unwrap();
        assert_eq!(set.report().unwrap().versions(), vec![2, 3]);
        assert_eq!(store.records(set.table()).len(), 3);
    }

    #[tokio::test]
    async fn unapplied_versions_below_the_highest_are_skipped() {
        let store = MemoryStore::new();
        let mut set = MigrationSet::new().with_sql(SqlSource::embedded(
            "first",
            &[("0005_late.up.sql", "CREATE TABLE late (id INT)")],
        ));
        set.execute(&store).await.unwrap();

        set.register_sql([SqlSource::embedded(
            "second",
            &[("0003_early.up.sql", "CREATE TABLE early (id INT)")],
        )]);
        set.execute(&store).await.unwrap();
        assert!(set.report().unwrap().is_empty());

        let status = set.status(&store).await.unwrap();
        assert_eq!(status.applied.len(), 1);
        assert!(status.pending.is_empty());
    }

    #[tokio::test]
    async fn rollback_targets() {
        let store = MemoryStore::new();
        let mut set = MigrationSet::new().with_sql(SqlSource::embedded(
            "bundled",
            &[
                ("0001_a.up.sql", "CREATE TABLE a (id INT)"),
                ("0001_a.down.sql", "DROP TABLE a"),
                ("0002_b.up.sql", "CREATE TABLE b (id INT)"),
                ("0002_b.down.sql", "DROP TABLE b"),
            ],
        ));
        set.execute(&store).await.unwrap();

        set.register_sql([SqlSource::embedded(
            "later",
            &[
                ("0003_c.up.sql", "CREATE TABLE c (id INT)"),
                ("0003_c.down.sql", "DROP TABLE c"),
                ("0004_d.up.sql", "CREATE TABLE d (id INT)"),
                ("0004_d.down.sql", "DROP TABLE d"),
            ],
        )]);
        set.execute(&store).await.unwrap();
        assert_eq!(set.report().unwrap().id, 2);

        set.rollback(&store, RollbackTarget::LastGroup).await.unwrap();
        assert_eq!(set.report().unwrap().versions(), vec![4, 3]);

        set.rollback(&store, RollbackTarget::ToVersion(0)).await.unwrap();
        assert_eq!(set.report().unwrap().versions(), vec![2, 1]);
        assert!(store.records(set.table()).is_empty());

        let executed = store.executed();
        let drops: Vec<&str> = executed
            .iter()
            .map(String::as_str)
            .filter(|sql| sql.starts_with("DROP"))
            .collect();
        assert_eq!(drops, vec!["DROP TABLE d", "DROP TABLE c", "DROP TABLE b", "DROP TABLE a"]);

        set.rollback(&store, RollbackTarget::default()).await.unwrap();
        assert!(set.report().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_refuses_unregistered_migrations() {
        let store = MemoryStore::new();
        let mut first = MigrationSet::new().with_sql(SqlSource::embedded(
            "bundled",
            &[("0001_a.up.sql", "CREATE TABLE a (id INT)")],
        ));
        first.execute(&store).await.unwrap();

        let mut empty = MigrationSet::new();
        let err = empty.rollback(&store, RollbackTarget::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Migration);
        assert_eq!(store.records(first.table()).len(), 1);
    }

    #[test]
    fn control_table_sql_uses_dialect() {
        let table = ControlTable::new("pgboot_migrations", Dialect::Postgres);
        assert!(table.create_sql().starts_with("CREATE TABLE IF NOT EXISTS \"pgboot_migrations\""));
        assert_eq!(
            table.insert_sql(),
            "INSERT INTO \"pgboot_migrations\" (version, name, group_id, applied_at) VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(table.delete_sql(), "DELETE FROM \"pgboot_migrations\" WHERE version = $1");
    }
}
