//! State store error types.

/// Errors produced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A statement or connection failed.
    #[error("database error while {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// File-system failure creating the database directory.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded.
    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

impl StateError {
    pub(crate) fn database(operation: &'static str) -> impl Fn(sqlx::Error) -> Self {
        move |source| Self::Database { operation, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
