//! Error types for the Gold pipeline.

use claims360_table::TableError;

/// The result type used throughout claims360-gold.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A table operation failed.
    #[error(transparent)]
    Table(#[from] TableError),

    /// A core operation (storage, ids) failed.
    #[error(transparent)]
    Core(#[from] claims360_core::Error),

    /// An upstream table could not be read. Nothing was written and no
    /// stream position moved.
    #[error("source {table} unavailable: {source}")]
    SourceUnavailable {
        /// Qualified name of the upstream table.
        table: String,
        /// The underlying failure.
        #[source]
        source: TableError,
    },

    /// A micro-batch held invalid events and the policy rejects the batch.
    #[error("{count} invalid event(s) in source versions {after_version}..={end_version}: {first}")]
    InvalidEvents {
        /// Number of invalid events in the batch.
        count: usize,
        /// Batch start position (exclusive).
        after_version: u64,
        /// Batch end position (inclusive).
        end_version: u64,
        /// Reason for the first invalid event.
        first: String,
    },

    /// A committed target row cannot be indexed.
    #[error("corrupt row in {table}: {message}")]
    CorruptTarget {
        /// Qualified table name.
        table: String,
        /// What is wrong with the row.
        message: String,
    },

    /// A cycle was detected in the stage graph.
    #[error("cycle detected in stage graph: {cycle:?}")]
    CycleDetected {
        /// Stages left unscheduled by the cycle.
        cycle: Vec<String>,
    },

    /// A graph node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// A stage referenced an input that is not declared.
    #[error("stage {stage} depends on unknown stage {input}")]
    StageNotFound {
        /// The declaring stage.
        stage: String,
        /// The missing input.
        input: String,
    },

    /// A record could not be converted to or from a table row.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable serialization details.
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Which setting is invalid, and why.
        message: String,
    },
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Wraps a failed upstream read.
    #[must_use]
    pub fn source_unavailable(table: impl Into<String>, source: TableError) -> Self {
        Self::SourceUnavailable {
            table: table.into(),
            source,
        }
    }

    /// Returns true when the failed stage can be retried unchanged by the
    /// scheduler.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Table(e) => e.is_retryable(),
            Self::Core(e) => e.is_transient(),
            Self::SourceUnavailable { .. } => true,
            _ => false,
        }
    }
}
