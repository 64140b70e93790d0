//! Utilities for pgboot
//!
//! This module provides utility functions used across the library.

pub mod logging;
pub mod naming;
pub mod ping;

// Re-export key utility functions
pub use naming::{migration_file_names, quote_ident, timestamp_version};
pub use ping::{wait_for_ping, wait_for_ping_auto, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_TIMEOUT};
