//! Naming utilities for pgboot
//!
//! Identifier quoting and migration file naming.

use chrono::{DateTime, Utc};
use inflector::Inflector;

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Format name as a slug usable in a migration file name
pub fn migration_slug(description: &str) -> String {
    let cleaned: String = description
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { ' ' })
        .collect();

    cleaned.to_snake_case()
}

/// Timestamp-based migration version
pub fn timestamp_version(now: DateTime<Utc>) -> i64 {
    // %Y%m%d%H%M%S is all digits and fits in an i64 until year 9223.
    now.format("%Y%m%d%H%M%S")
        .to_string()
        .parse()
        .unwrap_or_default()
}

/// Up and down file names for a new migration.
pub fn migration_file_names(version: i64, description: &str, transactional: bool) -> (String, String) {
    let stem = format!("{}_{}", version, migration_slug(description));
    let marker = if transactional { "" } else { ".notx" };

    (
        format!("{}{}.up.sql", stem, marker),
        format!("{}{}.down.sql", stem, marker),
    )
}
