use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification consumed by the retry policy and by callers that
/// decide how to present a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    Rejected,
    Cancelled,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("request timed out: {message}")]
    Timeout { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("rejected by database: {message}")]
    Rejected { message: String },
    #[error("request superseded by a newer one")]
    Cancelled,
    #[error("{message}")]
    Unknown { message: String },
}

pub type DataResult<T> = Result<T, DataError>;

impl DataError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::Network { .. } => ErrorKind::Network,
            DataError::Timeout { .. } => ErrorKind::Timeout,
            DataError::Validation { .. } => ErrorKind::Validation,
            DataError::Rejected { .. } => ErrorKind::Rejected,
            DataError::Cancelled => ErrorKind::Cancelled,
            DataError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Timeout)
    }
}

// SQLSTATE 42501 is insufficient_privilege; class 23 covers integrity
// constraint violations.
fn is_rejection_code(code: &str) -> bool {
    code == "42501" || code.starts_with("23")
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => DataError::timeout(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DataError::network(err.to_string()),
            sqlx::Error::Database(ref db_err) => {
                let rejected = db_err
                    .code()
                    .map(|code| is_rejection_code(&code))
                    .unwrap_or(false);
                if rejected {
                    DataError::rejected(db_err.message().to_string())
                } else {
                    DataError::unknown(err.to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => DataError::validation(err.to_string()),
            other => DataError::unknown(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(DataError::network("reset").is_retryable());
        assert!(DataError::timeout("slow").is_retryable());
        assert!(!DataError::validation("bad status").is_retryable());
        assert!(!DataError::rejected("rls").is_retryable());
        assert!(!DataError::Cancelled.is_retryable());
        assert!(!DataError::unknown("??").is_retryable());
    }

    #[test]
    fn sqlx_errors_are_classified_once() {
        assert_eq!(
            DataError::from(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            DataError::from(sqlx::Error::PoolClosed).kind(),
            ErrorKind::Network
        );
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(DataError::from(sqlx::Error::Io(io)).kind(), ErrorKind::Network);
        assert_eq!(
            DataError::from(sqlx::Error::ColumnNotFound("status".into())).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            DataError::from(sqlx::Error::RowNotFound).kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn message_text_does_not_drive_classification() {
        let err = DataError::unknown("network timeout while reading");
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejection_codes_cover_constraints_and_privileges() {
        assert!(is_rejection_code("23505"));
        assert!(is_rejection_code("23503"));
        assert!(is_rejection_code("42501"));
        assert!(!is_rejection_code("42P01"));
    }
}
