//! Transactional tables for the claims360 Gold pipeline.
//!
//! A table is a commit log of put-if-absent JSON entries over catalog-scoped
//! object storage, in the style of the Delta Lake protocol:
//!
//! - **Batch read**: the latest commit entry lists the active data files
//! - **Append stream**: append commits are read version by version, resuming
//!   from a caller-held position
//! - **Merge commit**: atomic replacement of a keyed table's contents, carrying
//!   change records and a stream transaction marker
//! - **Change feed**: row-level changes per committed version
//!
//! Writing `_log/{version}.json` with a `DoesNotExist` precondition is the
//! only commit point. Files written before a failed commit point are never
//! referenced, so readers see either the previous version or the new one.
//!
//! Non-goals: compaction, vacuum of unreferenced files, checkpoints.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod change_feed;
pub mod error;
pub mod metrics;
pub mod schema;
pub mod stream;
pub mod table;
pub mod types;

pub use change_feed::{ChangeRecord, ChangeType, RowChange};
pub use error::{Result, TableError};
pub use schema::{Column, DataType, TableSchema};
pub use stream::{AppendBatch, VersionedRow};
pub use table::{Table, TableConfig};
pub use types::{
    CommitEntry, CommitMetrics, CommitOutcome, MergeCommit, Operation, Row, StreamTxn,
    TableMetadata, TableName, TableProperties, TableSnapshot,
};
