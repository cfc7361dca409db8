//! Classification of `sqlx` errors into repository errors.
//!
//! No `sqlx` type crosses the repository boundary; callers only ever see a
//! `RepositoryError`.

use tessera_core::repository::RepositoryError;

use crate::schema::STREAM_SEQUENCE_CONSTRAINT;

/// SQLSTATE of a unique constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Maps a driver error onto the repository taxonomy.
pub(crate) fn classify(err: sqlx::Error) -> RepositoryError {
    if is_transient(&err) {
        return RepositoryError::Transient(Box::new(err));
    }
    match err {
        e @ (sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)) => RepositoryError::Corrupt(e.to_string()),
        other => RepositoryError::Backend(Box::new(other)),
    }
}

/// Whether `err` is a uniqueness violation of the per-stream sequence
/// constraint.
pub(crate) fn is_stream_sequence_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
            && db_err.constraint() == Some(STREAM_SEQUENCE_CONSTRAINT);
    }
    false
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| is_transient_code(&code)),
        _ => false,
    }
}

/// SQLSTATEs worth retrying: serialization failures, deadlocks, lock
/// timeouts, connection exceptions and server shutdown or overload.
fn is_transient_code(code: &str) -> bool {
    code.starts_with("08")
        || matches!(
            code,
            "40001" | "40P01" | "55P03" | "57P01" | "57P02" | "57P03" | "53300"
        )
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_connection_failures_are_transient() {
        let io_err = sqlx::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));

        assert!(matches!(classify(io_err), RepositoryError::Transient(_)));
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut),
            RepositoryError::Transient(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::PoolClosed),
            RepositoryError::Transient(_)
        ));
    }

    #[test]
    fn test_decode_failures_are_corrupt() {
        let err = sqlx::Error::ColumnDecode {
            index: "payload".to_string(),
            source: "not json".into(),
        };

        assert!(matches!(classify(err), RepositoryError::Corrupt(_)));
    }

    #[test]
    fn test_other_failures_are_backend_faults() {
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            RepositoryError::Backend(_)
        ));
    }

    #[test]
    fn test_transient_sqlstates() {
        for code in ["40001", "40P01", "08006", "08003", "57P01", "53300"] {
            assert!(is_transient_code(code), "{code} should be transient");
        }
        for code in ["23505", "42P01", "22P02"] {
            assert!(!is_transient_code(code), "{code} should not be transient");
        }
    }

    #[test]
    fn test_non_database_errors_are_not_sequence_violations() {
        assert!(!is_stream_sequence_violation(&sqlx::Error::RowNotFound));
    }
}
