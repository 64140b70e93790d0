//! Error types for pgboot
//!
//! Store failures are normalized once, where they leave the driver (see
//! [`crate::db::normalize`]). Everything above that boundary wraps the cause
//! instead of discarding it, so [`Error::is`] can still see through the layers.

use thiserror::Error;

/// Result type for pgboot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification of an [`Error`], independent of the driver in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidEntity,
    ConstraintViolation,
    UniqueConstraintViolation,
    MissingRelation,
    NotFound,
    Timeout,
    MissingStore,
    UnreachableStore,
    EnvironmentGuardViolation,
    Discovery,
    Connect,
    Migration,
    Config,
    Io,
    Store,
    Serialization,
}

impl ErrorKind {
    /// The more general kind this one specializes, if any.
    pub fn parent(self) -> Option<ErrorKind> {
        match self {
            ErrorKind::UniqueConstraintViolation => Some(ErrorKind::ConstraintViolation),
            ErrorKind::ConstraintViolation | ErrorKind::MissingRelation => {
                Some(ErrorKind::InvalidEntity)
            }
            _ => None,
        }
    }

    /// Whether `self` is `other` or one of its specializations.
    pub fn is_a(self, other: ErrorKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

/// Error types for pgboot
#[derive(Error, Debug)]
pub enum Error {
    #[error("entity is not valid: record does not satisfy some of the column constraints")]
    ConstraintViolation(#[source] sqlx::Error),

    #[error("entity is not valid: record does not satisfy some of the column constraints: some unique columns have duplicates")]
    UniqueConstraintViolation(#[source] sqlx::Error),

    #[error("entity is not valid: a required relation is missing")]
    MissingRelation(#[source] sqlx::Error),

    #[error("could not find any record matching the request")]
    NotFound,

    #[error("statement timed out: {0}")]
    Timeout(#[source] sqlx::Error),

    #[error("missing store handle")]
    MissingStore,

    #[error("failed to reach database: {0}")]
    UnreachableStore(#[source] Box<Error>),

    #[error("reset_on_conn is only available in test environments (ENV=test)")]
    EnvironmentGuardViolation,

    #[error("failed to discover migrations on {source_name}: {message}")]
    Discovery { source_name: String, message: String },

    #[error("failed to connect to database client: {0}")]
    Connect(#[source] Box<Error>),

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Migration plan error: {0}")]
    MigrationPlan(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub(crate) fn discovery(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Discovery {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Classification of this error, ignoring whatever it wraps.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Error::UniqueConstraintViolation(_) => ErrorKind::UniqueConstraintViolation,
            Error::MissingRelation(_) => ErrorKind::MissingRelation,
            Error::NotFound => ErrorKind::NotFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::MissingStore => ErrorKind::MissingStore,
            Error::UnreachableStore(_) => ErrorKind::UnreachableStore,
            Error::EnvironmentGuardViolation => ErrorKind::EnvironmentGuardViolation,
            Error::Discovery { .. } => ErrorKind::Discovery,
            Error::Connect(_) => ErrorKind::Connect,
            Error::Migration { .. } | Error::MigrationPlan(_) => ErrorKind::Migration,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Sqlx(_) => ErrorKind::Store,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Matches `kind` against this error, its kind hierarchy, and every
    /// error it wraps.
    pub fn is(&self, kind: ErrorKind) -> bool {
        if self.kind().is_a(kind) {
            return true;
        }
        match self {
            Error::UnreachableStore(inner) | Error::Connect(inner) => inner.is(kind),
            Error::Migration { source, .. } => source.is(kind),
            _ => false,
        }
    }
}

/// Convert Serde JSON errors to pgboot errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

/// Convert TOML deserialization errors to pgboot errors
impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

/// Convert YAML errors to pgboot errors
impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_is_a_constraint_violation_and_invalid_entity() {
        let err = Error::UniqueConstraintViolation(sqlx::Error::RowNotFound);
        assert!(err.is(ErrorKind::UniqueConstraintViolation));
        assert!(err.is(ErrorKind::ConstraintViolation));
        assert!(err.is(ErrorKind::InvalidEntity));
        assert!(!err.is(ErrorKind::MissingRelation));
        assert!(!err.is(ErrorKind::NotFound));
    }

    #[test]
    fn missing_relation_is_an_invalid_entity_only() {
        let err = Error::MissingRelation(sqlx::Error::RowNotFound);
        assert!(err.is(ErrorKind::InvalidEntity));
        assert!(!err.is(ErrorKind::ConstraintViolation));
    }

    #[test]
    fn wrapped_errors_stay_visible() {
        let err = Error::Connect(Box::new(Error::UnreachableStore(Box::new(Error::Timeout(
            sqlx::Error::PoolTimedOut,
        )))));
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert!(err.is(ErrorKind::UnreachableStore));
        assert!(err.is(ErrorKind::Timeout));
        assert!(!err.is(ErrorKind::NotFound));

        let err = Error::Migration {
            version: 2,
            name: "add_col".to_string(),
            source: Box::new(Error::NotFound),
        };
        assert!(err.is(ErrorKind::Migration));
        assert!(err.is(ErrorKind::NotFound));
        assert!(err.to_string().contains("migration 2 (add_col) failed"));
    }
}
