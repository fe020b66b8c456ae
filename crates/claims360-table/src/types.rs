//! Shared table types (names, metadata, commit entries, snapshots).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use claims360_core::CommitId;
use claims360_core::scoped_storage::validate_id;
use serde::{Deserialize, Serialize};

use crate::change_feed::RowChange;
use crate::error::{Result, TableError};
use crate::schema::TableSchema;

/// A row: a JSON object keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Qualified table name (`schema.table`, e.g. `gold.fact_claim`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// Schema (medallion layer), e.g. `silver` or `gold`.
    pub schema: String,
    /// Table name within the schema.
    pub name: String,
}

impl TableName {
    /// Creates a table name.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::BadRequest`] if either part is not a valid id.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let name = name.into();
        validate_id(&schema, "schema").map_err(|e| TableError::bad_request(e.to_string()))?;
        validate_id(&name, "table").map_err(|e| TableError::bad_request(e.to_string()))?;
        Ok(Self { schema, name })
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl FromStr for TableName {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self> {
        let (schema, name) = s.split_once('.').ok_or_else(|| {
            TableError::bad_request(format!("table name must be schema.table (got {s})"))
        })?;
        Self::new(schema, name)
    }
}

/// Table properties.
///
/// Stored as pass-through metadata under their conventional keys. Only
/// `delta.enableChangeDataFeed` changes behavior: change files are written
/// for overwrite and merge commits when it is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Quality tier tag (`bronze`, `silver`, `gold`).
    #[serde(
        rename = "pipeline.quality",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub quality: Option<String>,
    /// Optimize-on-write flag.
    #[serde(rename = "pipelines.autoOptimize.managed", default)]
    pub auto_optimize: bool,
    /// Change data feed flag.
    #[serde(rename = "delta.enableChangeDataFeed", default)]
    pub change_data_feed: bool,
    /// Any other properties, carried verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl TableProperties {
    /// Properties tagged with a quality tier.
    #[must_use]
    pub fn quality(tier: impl Into<String>) -> Self {
        Self {
            quality: Some(tier.into()),
            ..Self::default()
        }
    }

    /// Enables optimize-on-write.
    #[must_use]
    pub fn with_auto_optimize(mut self) -> Self {
        self.auto_optimize = true;
        self
    }

    /// Enables the change data feed.
    #[must_use]
    pub fn with_change_data_feed(mut self) -> Self {
        self.change_data_feed = true;
        self
    }
}

/// Table metadata written once when the table is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Qualified name.
    pub name: TableName,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Enforced schema.
    pub schema: TableSchema,
    /// Table properties.
    pub properties: TableProperties,
}

impl TableMetadata {
    /// Creates metadata for `name` with `schema`.
    #[must_use]
    pub fn new(name: TableName, schema: TableSchema) -> Self {
        Self {
            name,
            comment: None,
            schema,
            properties: TableProperties::default(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Sets table properties.
    #[must_use]
    pub fn with_properties(mut self, properties: TableProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Kind of commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Version 0: table created, no data.
    Create,
    /// All data replaced.
    Overwrite,
    /// Rows added; existing files untouched.
    Append,
    /// Keyed contents replaced by a merge.
    Merge,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Overwrite => "overwrite",
            Self::Append => "append",
            Self::Merge => "merge",
        };
        f.write_str(s)
    }
}

/// Stream transaction marker: "application `app_id` has committed everything
/// from its source up to and including `source_version`".
///
/// The marker is written in the same commit entry as the data it describes,
/// so position and data become visible together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTxn {
    /// Stable id of the writing application (one per stream consumer).
    pub app_id: String,
    /// Last source version included in this commit.
    pub source_version: u64,
}

impl StreamTxn {
    /// Creates a marker.
    #[must_use]
    pub fn new(app_id: impl Into<String>, source_version: u64) -> Self {
        Self {
            app_id: app_id.into(),
            source_version,
        }
    }
}

/// Operation metrics recorded with each commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetrics {
    /// Rows in the files added by this commit.
    pub num_output_rows: u64,
    /// Rows inserted (merge only).
    #[serde(default)]
    pub num_inserted_rows: u64,
    /// Rows updated (merge only).
    #[serde(default)]
    pub num_updated_rows: u64,
    /// Rows removed (overwrite only).
    #[serde(default)]
    pub num_deleted_rows: u64,
}

/// A commit log entry (`_log/{version:020}.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    /// Commit version.
    pub version: u64,
    /// Commit attempt id (names the data/change files).
    pub commit_id: CommitId,
    /// Operation kind.
    pub operation: Operation,
    /// Commit timestamp.
    pub committed_at: DateTime<Utc>,
    /// Active data files after this commit, in read order.
    pub files: Vec<String>,
    /// Files added by this commit.
    pub added: Vec<String>,
    /// Rows in the active files after this commit.
    #[serde(default)]
    pub num_rows: u64,
    /// Change-feed file for this commit, if one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_file: Option<String>,
    /// Latest stream transaction marker per application id.
    #[serde(default)]
    pub txns: BTreeMap<String, u64>,
    /// Operation metrics.
    #[serde(default)]
    pub metrics: CommitMetrics,
}

/// A consistent point-in-time view of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    /// Committed version this snapshot reflects.
    pub version: u64,
    /// Active data files, in read order.
    pub files: Vec<String>,
    /// Rows in the active files.
    pub num_rows: u64,
    /// Stream transaction markers at this version.
    pub txns: BTreeMap<String, u64>,
}

impl TableSnapshot {
    /// Returns the committed source version for `app_id`, if any.
    #[must_use]
    pub fn txn_version(&self, app_id: &str) -> Option<u64> {
        self.txns.get(app_id).copied()
    }
}

impl From<&CommitEntry> for TableSnapshot {
    fn from(entry: &CommitEntry) -> Self {
        Self {
            version: entry.version,
            files: entry.files.clone(),
            num_rows: entry.num_rows,
            txns: entry.txns.clone(),
        }
    }
}

/// Outcome of an append or merge commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new version was committed.
    Committed(CommitEntry),
    /// The stream transaction marker showed the data was already committed;
    /// nothing was written.
    AlreadyApplied {
        /// Current table version.
        version: u64,
    },
    /// There was nothing to commit.
    Empty {
        /// Current table version.
        version: u64,
    },
}

impl CommitOutcome {
    /// Returns the table version after the request.
    #[must_use]
    pub fn version(&self) -> u64 {
        match self {
            Self::Committed(entry) => entry.version,
            Self::AlreadyApplied { version } | Self::Empty { version } => *version,
        }
    }

    /// Returns true if a new version was committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Request to commit a merge result.
///
/// `rows` is the complete keyed contents after the merge (copy-on-write);
/// `changes` are the row-level changes relative to `read_version`.
#[derive(Debug, Clone)]
pub struct MergeCommit {
    /// Version the merge was computed against. The commit fails with a
    /// conflict if the table has moved on.
    pub read_version: u64,
    /// Full table contents after the merge.
    pub rows: Vec<Row>,
    /// Row-level changes for the change feed.
    pub changes: Vec<RowChange>,
    /// Stream position committed with the data.
    pub txn: Option<StreamTxn>,
    /// Operation metrics.
    pub metrics: CommitMetrics,
}
