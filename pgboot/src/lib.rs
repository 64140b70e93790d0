//! pgboot: connection bring-up and versioned migrations for PostgreSQL
//!
//! pgboot opens a store through a driver, waits until it answers, optionally
//! recreates a throwaway test schema and applies pending SQL or procedural
//! migrations before handing the connection to the caller.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;


// Re-export main types for easier access
pub use client::{
    new_client, new_client_with_driver, ping_store, ClientConfig, Environment, Readiness, ResetTarget,
};
pub use config::Config;
pub use db::connection::{ClientOption, Database};
pub use db::driver::{Driver, DriverConfig, ExtendedDriver, SimpleDriver};
pub use db::migrations::{
    MigrationGroup, MigrationRecord, MigrationSet, MigrationStatus, MigrationTx, ProceduralMigration,
    RollbackTarget, SqlSource,
};
pub use db::normalize::{normalize, require_rows_affected};
pub use db::store::{RawHandle, Store};
pub use db::types::PgDuration;
pub use error::{Error, ErrorKind, Result};
pub use pgboot_macros::migration;
pub use utils::ping::{wait_for_ping, wait_for_ping_auto};

use sqlx::PgPool;

/// Load a configuration file and bring up a client from it.
///
/// The environment marker is read from `ENV`.
pub async fn init(config_path: &str) -> Result<(Database, PgPool)> {
    let config = config::load_from_file(config_path)?;
    let mut client_config = config.client_config(Environment::from_env());
    new_client(&mut client_config).await
}
