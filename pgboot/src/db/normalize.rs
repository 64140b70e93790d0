//! Store error normalization
//!
//! Maps sqlx errors, mostly a SQLSTATE code plus a formatted message, onto the
//! [`Error`] taxonomy. The missing-relation rule matches on message text and
//! depends on the marker raised by the schema's triggers.

use sqlx::postgres::PgQueryResult;

use crate::error::{Error, ErrorKind, Result};

/// SQLSTATE class for integrity constraint violations.
pub const INTEGRITY_VIOLATION_CLASS: &str = "23";
/// SQLSTATE for `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for `query_canceled`, raised when `statement_timeout` fires.
pub const QUERY_CANCELED: &str = "57014";
/// Marker raised by application triggers when a referenced row is missing.
pub const DEFAULT_MISSING_RELATION_MARKER: &str = "MISSING_RELATION";

/// Maps [`sqlx::Error`] values onto the pgboot error taxonomy.
#[derive(Debug, Clone)]
pub struct ErrorNormalizer {
    missing_relation_marker: String,
}

impl Default for ErrorNormalizer {
    fn default() -> Self {
        Self {
            missing_relation_marker: DEFAULT_MISSING_RELATION_MARKER.to_string(),
        }
    }
}

impl ErrorNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different marker string for missing-relation errors.
    pub fn with_missing_relation_marker(mut self, marker: impl Into<String>) -> Self {
        self.missing_relation_marker = marker.into();
        self
    }

    /// Classify a driver error without consuming it.
    ///
    /// Rules are checked in order and the first match wins:
    /// no rows, integrity violation (unique or other), statement timeout,
    /// missing-relation marker.
    pub fn classify(&self, err: &sqlx::Error) -> Option<ErrorKind> {
        if matches!(err, sqlx::Error::RowNotFound) {
            return Some(ErrorKind::NotFound);
        }

        if let sqlx::Error::Database(db_err) = err {
            let code = db_err.code().map(|code| code.into_owned()).unwrap_or_default();

            if code.starts_with(INTEGRITY_VIOLATION_CLASS) {
                let unique = code == UNIQUE_VIOLATION
                    || matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation);
                return Some(if unique {
                    ErrorKind::UniqueConstraintViolation
                } else {
                    ErrorKind::ConstraintViolation
                });
            }

            if code == QUERY_CANCELED {
                return Some(ErrorKind::Timeout);
            }
        }

        if !self.missing_relation_marker.is_empty()
            && err.to_string().contains(&self.missing_relation_marker)
        {
            return Some(ErrorKind::MissingRelation);
        }

        None
    }

    /// Convert a driver error into a pgboot error. Unmatched errors are
    /// returned unchanged as [`Error::Sqlx`].
    pub fn normalize(&self, err: sqlx::Error) -> Error {
        match self.classify(&err) {
            Some(ErrorKind::NotFound) => Error::NotFound,
            Some(ErrorKind::UniqueConstraintViolation) => Error::UniqueConstraintViolation(err),
            Some(ErrorKind::ConstraintViolation) => Error::ConstraintViolation(err),
            Some(ErrorKind::Timeout) => Error::Timeout(err),
            Some(ErrorKind::MissingRelation) => Error::MissingRelation(err),
            _ => {
                tracing::debug!(error = %err, "Unclassified store error");
                Error::Sqlx(err)
            }
        }
    }
}

/// Normalize with the default marker set.
pub fn normalize(err: sqlx::Error) -> Error {
    ErrorNormalizer::default().normalize(err)
}

/// Normalize the error side of a driver result, passing successes through.
pub fn normalize_result<T>(result: std::result::Result<T, sqlx::Error>) -> Result<T> {
    result.map_err(normalize)
}

/// Anything that reports how many rows a statement touched.
pub trait RowsAffected {
    fn rows_affected(&self) -> u64;
}

impl RowsAffected for PgQueryResult {
    fn rows_affected(&self) -> u64 {
        PgQueryResult::rows_affected(self)
    }
}

impl RowsAffected for u64 {
    fn rows_affected(&self) -> u64 {
        *self
    }
}

/// Turn a silent no-op update or delete into [`Error::NotFound`].
pub fn require_rows_affected<R: RowsAffected + ?Sized>(result: &R) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::db_error;
    use rstest::rstest;

    #[rstest]
    #[case("23505", "duplicate key value violates unique constraint", ErrorKind::UniqueConstraintViolation)]
    #[case("23503", "insert or update violates foreign key constraint", ErrorKind::ConstraintViolation)]
    #[case("23502", "null value in column violates not-null constraint", ErrorKind::ConstraintViolation)]
    #[case("57014", "canceling statement due to statement timeout", ErrorKind::Timeout)]
    #[case("P0001", "MISSING_RELATION: author does not exist", ErrorKind::MissingRelation)]
    fn classifies_database_errors(
        #[case] code: &str,
        #[case] message: &str,
        #[case] expected: ErrorKind,
    ) {
        let err = normalize(db_error(code, message));
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        assert!(matches!(normalize(sqlx::Error::RowNotFound), Error::NotFound));
    }

    #[test]
    fn unique_violation_matches_the_whole_hierarchy() {
        let err = normalize(db_error(UNIQUE_VIOLATION, "duplicate key"));
        assert!(err.is(ErrorKind::UniqueConstraintViolation));
        assert!(err.is(ErrorKind::ConstraintViolation));
        assert!(err.is(ErrorKind::InvalidEntity));
    }

    #[test]
    fn integrity_violation_wins_over_marker() {
        let err = normalize(db_error("23503", "MISSING_RELATION in fk"));
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }

    #[test]
    fn timeout_keeps_original_error() {
        let err = normalize(db_error(QUERY_CANCELED, "canceling statement due to statement timeout"));
        let source = std::error::Error::source(&err).map(|source| source.to_string());
        assert!(source.unwrap_or_default().contains("statement timeout"));
    }

    #[test]
    fn unmatched_errors_pass_through() {
        let err = normalize(db_error("42601", "syntax error at or near \"SELEC\""));
        assert!(matches!(err, Error::Sqlx(sqlx::Error::Database(_))));

        let err = normalize(sqlx::Error::PoolClosed);
        assert!(matches!(err, Error::Sqlx(sqlx::Error::PoolClosed)));
    }

    #[test]
    fn custom_marker() {
        let normalizer = ErrorNormalizer::new().with_missing_relation_marker("APP=NOREF");
        let err = normalizer.normalize(db_error("P0001", "APP=NOREF chapter"));
        assert_eq!(err.kind(), ErrorKind::MissingRelation);

        let err = normalizer.normalize(db_error("P0001", "MISSING_RELATION chapter"));
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[test]
    fn normalize_result_passes_success_through() {
        assert_eq!(normalize_result(Ok::<_, sqlx::Error>(3)).ok(), Some(3));
        assert!(matches!(
            normalize_result::<()>(Err(sqlx::Error::RowNotFound)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn rows_affected_guard() {
        assert!(matches!(require_rows_affected(&0u64), Err(Error::NotFound)));
        assert!(require_rows_affected(&1u64).is_ok());
        assert!(matches!(
            require_rows_affected(&PgQueryResult::default()),
            Err(Error::NotFound)
        ));
    }
}
