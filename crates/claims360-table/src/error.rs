//! Error types for `claims360-table`.

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Table-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// Invalid input from a caller.
    #[error("bad request: {message}")]
    BadRequest {
        /// Human-readable error details.
        message: String,
    },

    /// Optimistic concurrency conflict (another writer committed the version).
    #[error("conflict: {message}")]
    Conflict {
        /// Human-readable conflict details.
        message: String,
    },

    /// The requested table or version was not found.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable not-found details.
        message: String,
    },

    /// A row does not satisfy the table schema.
    #[error("schema violation in {table}: {message}")]
    SchemaViolation {
        /// Qualified table name.
        table: String,
        /// Which row and column failed, and why.
        message: String,
    },

    /// A stream reader met a commit that is not an append.
    #[error("source {table} is not append-only: version {version} is a {operation} commit")]
    NotAppendOnly {
        /// Qualified table name.
        table: String,
        /// The offending commit version.
        version: u64,
        /// The offending operation.
        operation: String,
    },

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] claims360_core::Error),

    /// Failed to serialize/deserialize JSON state.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable serialization details.
        message: String,
    },
}

impl TableError {
    /// Creates a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true when the failed operation can be retried unchanged.
    ///
    /// Conflicts and transient storage failures are retryable; schema
    /// violations and append-only breaches are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_retryable() {
        assert!(TableError::conflict("version 3 taken").is_retryable());
        assert!(TableError::Storage(claims360_core::Error::storage("timeout")).is_retryable());
    }

    #[test]
    fn schema_violation_is_fatal() {
        let err = TableError::SchemaViolation {
            table: "gold.fact_claim".into(),
            message: "row 0: claim_id is required".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("gold.fact_claim"));
    }
}
