//! Store drivers
//!
//! A [`Driver`] opens the `(store, raw)` handle pair. Two PostgreSQL variants
//! exist: [`SimpleDriver`] speaks the simple query protocol and is built from
//! structured options, [`ExtendedDriver`] parses a DSN and keeps the extended
//! protocol available.

mod extended;
mod simple;

pub use extended::{ExtendedDriver, SlowStatementLog};
pub use simple::{ConnOption, ConnectHook, Network, ResolvedOptions, SimpleDriver, SslMode, TlsSettings};

use serde::Deserialize;
use sqlx::PgPool;

use crate::db::connection::{ClientOption, Database};
use crate::db::store::{RawHandle, Store};
use crate::error::Result;

/// Opens a store handle together with its raw connection pool.
///
/// Opening performs no network I/O; reachability is checked afterwards by
/// pinging the store.
pub trait Driver: Send + Sync {
    type Store: Store + 'static;
    type Raw: RawHandle + 'static;

    fn connect(&self, options: &[ClientOption]) -> Result<(Self::Store, Self::Raw)>;
}

/// Driver selected in a configuration file with `driver = "simple"` or
/// `driver = "extended"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DriverConfig {
    Simple(SimpleDriver),
    Extended(ExtendedDriver),
}

impl Driver for DriverConfig {
    type Store = Database;
    type Raw = PgPool;

    fn connect(&self, options: &[ClientOption]) -> Result<(Database, PgPool)> {
        match self {
            DriverConfig::Simple(driver) => driver.connect(options),
            DriverConfig::Extended(driver) => driver.connect(options),
        }
    }
}

impl From<SimpleDriver> for DriverConfig {
    fn from(driver: SimpleDriver) -> Self {
        DriverConfig::Simple(driver)
    }
}

impl From<ExtendedDriver> for DriverConfig {
    fn from(driver: ExtendedDriver) -> Self {
        DriverConfig::Extended(driver)
    }
}
