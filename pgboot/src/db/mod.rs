//! Database module for pgboot
//!
//! This module handles drivers, store handles, error normalization and migrations.

pub mod connection;
pub mod driver;
pub mod executor;
pub mod migrations;
pub mod normalize;
pub mod store;
pub mod types;

// Re-export key types
pub use connection::{ClientOption, ClientSettings, Database, Dialect};
pub use driver::{Driver, DriverConfig, ExtendedDriver, SimpleDriver};
pub use executor::SqlExecutor;
pub use migrations::{
    MigrationGroup, MigrationRecord, MigrationSet, MigrationTx, ProceduralMigration, RollbackTarget,
    SqlSource,
};
pub use normalize::{normalize, require_rows_affected, ErrorNormalizer};
pub use store::{RawHandle, Store, StoreTransaction};
pub use types::PgDuration;
