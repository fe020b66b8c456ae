//! Table handle and commit protocol.
//!
//! A commit:
//! 1) Validates every row against the schema.
//! 2) Writes the data file (and change file) under a fresh commit id.
//! 3) Writes `_log/{read_version + 1}.json` with a `DoesNotExist` precondition.
//!    This is the commit point; losing the race is a conflict.
//! 4) Best-effort updates the `_last_commit.json` hint.
//!
//! Blind writes (overwrite, append) rebase and retry on conflict. Merges do
//! not: their contents were computed against `read_version`, so the caller
//! must recompute.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use claims360_core::{CommitId, ScopedStorage, TablePaths, WritePrecondition, WriteResult};
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::change_feed::{ChangeType, RowChange};
use crate::error::{Result, TableError};
use crate::metrics;
use crate::types::{
    CommitEntry, CommitMetrics, CommitOutcome, MergeCommit, Operation, Row, StreamTxn,
    TableMetadata, TableName, TableSnapshot,
};

/// Table configuration.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Maximum number of rebase attempts for blind writes.
    pub max_commit_retries: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 8,
        }
    }
}

/// Handle to one table.
#[derive(Clone)]
pub struct Table {
    storage: ScopedStorage,
    paths: TablePaths,
    metadata: TableMetadata,
    config: TableConfig,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.metadata.name)
            .field("catalog", &self.storage.catalog())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LastCommitHint {
    version: u64,
}

/// What a blind write puts in its commit entry.
struct PendingCommit {
    commit_id: CommitId,
    operation: Operation,
    files: Vec<String>,
    added: Vec<String>,
    num_rows: u64,
    change_file: Option<String>,
    txn: Option<StreamTxn>,
    metrics: CommitMetrics,
}

impl Table {
    /// Creates the table, or opens it if it already exists with the same
    /// metadata.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Conflict`] if a table with the same name but
    /// different metadata exists, and storage errors otherwise.
    pub async fn create(storage: ScopedStorage, metadata: TableMetadata) -> Result<Self> {
        let paths = table_paths(&metadata.name)?;
        let json = to_json_bytes(&metadata, "table metadata")?;

        let put = storage
            .put_raw(&paths.metadata(), json, WritePrecondition::DoesNotExist)
            .await?;
        if let WriteResult::PreconditionFailed { .. } = put {
            let existing: TableMetadata =
                from_json_bytes(&storage.get_raw(&paths.metadata()).await?, "table metadata")?;
            if existing != metadata {
                return Err(TableError::conflict(format!(
                    "table {} already exists with different metadata",
                    metadata.name
                )));
            }
        }

        let table = Self {
            storage,
            paths,
            metadata,
            config: TableConfig::default(),
        };

        let genesis = CommitEntry {
            version: 0,
            commit_id: CommitId::generate(),
            operation: Operation::Create,
            committed_at: Utc::now(),
            files: Vec::new(),
            added: Vec::new(),
            num_rows: 0,
            change_file: None,
            txns: BTreeMap::new(),
            metrics: CommitMetrics::default(),
        };
        let put = table
            .storage
            .put_raw(
                &table.paths.log_entry(0),
                to_json_bytes(&genesis, "commit entry")?,
                WritePrecondition::DoesNotExist,
            )
            .await?;
        if put.is_success() {
            tracing::info!(table = %table.name(), "created table");
        }

        Ok(table)
    }

    /// Opens an existing table.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] if the table has not been created.
    pub async fn open(storage: ScopedStorage, name: &TableName) -> Result<Self> {
        let paths = table_paths(name)?;
        if storage.head_raw(&paths.metadata()).await?.is_none() {
            return Err(TableError::not_found(format!("table {name} does not exist")));
        }
        let metadata: TableMetadata =
            from_json_bytes(&storage.get_raw(&paths.metadata()).await?, "table metadata")?;
        Ok(Self {
            storage,
            paths,
            metadata,
            config: TableConfig::default(),
        })
    }

    /// Sets table configuration.
    #[must_use]
    pub fn with_config(mut self, config: TableConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the qualified table name.
    #[must_use]
    pub fn name(&self) -> &TableName {
        &self.metadata.name
    }

    /// Returns the table metadata.
    #[must_use]
    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    // === Reads ===

    /// Returns the latest committed version.
    ///
    /// Starts from the `_last_commit.json` hint and probes forward, so a
    /// stale or missing hint only costs extra `head` calls.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] if version 0 is missing.
    pub async fn latest_version(&self) -> Result<u64> {
        let hint = match self.storage.head_raw(&self.paths.last_commit_hint()).await? {
            Some(_) => {
                let hint: LastCommitHint = self.read_json(&self.paths.last_commit_hint()).await?;
                hint.version
            }
            None => 0,
        };

        let mut version = hint;
        if self
            .storage
            .head_raw(&self.paths.log_entry(version))
            .await?
            .is_none()
        {
            if version == 0 {
                return Err(TableError::not_found(format!(
                    "table {} has no commits",
                    self.name()
                )));
            }
            version = 0;
        }

        while self
            .storage
            .head_raw(&self.paths.log_entry(version + 1))
            .await?
            .is_some()
        {
            version += 1;
        }
        Ok(version)
    }

    /// Reads the commit entry for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] if the version was never committed.
    pub async fn commit_entry(&self, version: u64) -> Result<CommitEntry> {
        let path = self.paths.log_entry(version);
        if self.storage.head_raw(&path).await?.is_none() {
            return Err(TableError::not_found(format!(
                "{} has no version {version}",
                self.name()
            )));
        }
        self.read_json(&path).await
    }

    /// Returns a snapshot of the latest committed version.
    ///
    /// # Errors
    ///
    /// Returns storage and serialization errors.
    pub async fn snapshot(&self) -> Result<TableSnapshot> {
        let version = self.latest_version().await?;
        let entry = self.commit_entry(version).await?;
        Ok(TableSnapshot::from(&entry))
    }

    /// Reads all rows of a snapshot, in file order.
    ///
    /// # Errors
    ///
    /// Returns storage and serialization errors.
    pub async fn read_rows(&self, snapshot: &TableSnapshot) -> Result<Vec<Row>> {
        let files = try_join_all(
            snapshot
                .files
                .iter()
                .map(|path| self.read_json::<Vec<Row>>(path)),
        )
        .await?;
        Ok(files.into_iter().flatten().collect())
    }

    /// Reads the latest snapshot as typed rows.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Serialization`] if a row does not decode as `T`.
    pub async fn read_as<T: DeserializeOwned>(&self) -> Result<(TableSnapshot, Vec<T>)> {
        let snapshot = self.snapshot().await?;
        let rows = self.read_rows(&snapshot).await?;
        let typed = rows
            .into_iter()
            .map(|row| {
                serde_json::from_value(serde_json::Value::Object(row)).map_err(|e| {
                    TableError::serialization(format!("failed to decode {} row: {e}", self.name()))
                })
            })
            .collect::<Result<Vec<T>>>()?;
        Ok((snapshot, typed))
    }

    /// Returns the committed source version recorded for `app_id`.
    ///
    /// # Errors
    ///
    /// Returns storage and serialization errors.
    pub async fn txn_version(&self, app_id: &str) -> Result<Option<u64>> {
        Ok(self.snapshot().await?.txn_version(app_id))
    }

    // === Writes ===

    /// Atomically replaces the table contents with `rows`.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::SchemaViolation`] before writing anything if a
    /// row is invalid, and storage errors if the commit cannot be made.
    #[tracing::instrument(skip(self, rows), fields(table = %self.name(), rows = rows.len()))]
    pub async fn overwrite(&self, rows: Vec<Row>) -> Result<CommitEntry> {
        self.validate_rows(&rows)?;
        let data = to_json_bytes(&rows, "data file")?;
        let num_rows = rows.len() as u64;

        for _ in 0..self.config.max_commit_retries {
            let snapshot = self.snapshot().await?;
            let commit_id = CommitId::generate();

            let mut added = Vec::new();
            if !rows.is_empty() {
                let path = self.paths.data_file(commit_id);
                self.put_new(&path, data.clone()).await?;
                added.push(path);
            }

            let change_file = if self.metadata.properties.change_data_feed {
                let previous = self.read_rows(&snapshot).await?;
                let changes: Vec<RowChange> = previous
                    .into_iter()
                    .map(|row| RowChange::new(ChangeType::Delete, row))
                    .chain(
                        rows.iter()
                            .cloned()
                            .map(|row| RowChange::new(ChangeType::Insert, row)),
                    )
                    .collect();
                Some(self.write_changes(commit_id, &changes).await?)
            } else {
                None
            };

            let pending = PendingCommit {
                commit_id,
                operation: Operation::Overwrite,
                files: added.clone(),
                added,
                num_rows,
                change_file,
                txn: None,
                metrics: CommitMetrics {
                    num_output_rows: num_rows,
                    num_deleted_rows: snapshot.num_rows,
                    ..CommitMetrics::default()
                },
            };

            match self.try_commit(&snapshot, pending).await? {
                Some(entry) => return Ok(entry),
                None => continue,
            }
        }

        Err(self.retries_exhausted())
    }

    /// Atomically appends `rows`, optionally recording a stream position.
    ///
    /// With a `txn`, the append is skipped when the table already records
    /// `txn.source_version` (or later) for `txn.app_id`, which makes replays
    /// of the same source range no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::SchemaViolation`] before writing anything if a
    /// row is invalid, and storage errors if the commit cannot be made.
    #[tracing::instrument(skip(self, rows, txn), fields(table = %self.name(), rows = rows.len()))]
    pub async fn append(&self, rows: Vec<Row>, txn: Option<StreamTxn>) -> Result<CommitOutcome> {
        self.validate_rows(&rows)?;
        let data = to_json_bytes(&rows, "data file")?;
        let num_rows = rows.len() as u64;

        for _ in 0..self.config.max_commit_retries {
            let snapshot = self.snapshot().await?;

            if let Some(txn) = &txn {
                if snapshot
                    .txn_version(&txn.app_id)
                    .is_some_and(|v| v >= txn.source_version)
                {
                    return Ok(CommitOutcome::AlreadyApplied {
                        version: snapshot.version,
                    });
                }
            } else if rows.is_empty() {
                return Ok(CommitOutcome::Empty {
                    version: snapshot.version,
                });
            }

            let commit_id = CommitId::generate();
            let mut files = snapshot.files.clone();
            let mut added = Vec::new();
            if !rows.is_empty() {
                let path = self.paths.data_file(commit_id);
                self.put_new(&path, data.clone()).await?;
                files.push(path.clone());
                added.push(path);
            }

            let pending = PendingCommit {
                commit_id,
                operation: Operation::Append,
                files,
                added,
                num_rows: snapshot.num_rows + num_rows,
                change_file: None,
                txn: txn.clone(),
                metrics: CommitMetrics {
                    num_output_rows: num_rows,
                    num_inserted_rows: num_rows,
                    ..CommitMetrics::default()
                },
            };

            match self.try_commit(&snapshot, pending).await? {
                Some(entry) => return Ok(CommitOutcome::Committed(entry)),
                None => continue,
            }
        }

        Err(self.retries_exhausted())
    }

    /// Commits a merge result computed against `merge.read_version`.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Conflict`] if the table is no longer at
    /// `read_version`, [`TableError::SchemaViolation`] if a row is invalid,
    /// and storage errors otherwise. Nothing becomes visible on error.
    #[tracing::instrument(
        skip(self, merge),
        fields(
            table = %self.name(),
            read_version = merge.read_version,
            rows = merge.rows.len(),
            changes = merge.changes.len()
        )
    )]
    pub async fn commit_merge(&self, merge: MergeCommit) -> Result<CommitEntry> {
        self.validate_rows(&merge.rows)?;

        let entry = self.commit_entry(merge.read_version).await?;
        let snapshot = TableSnapshot::from(&entry);
        let commit_id = CommitId::generate();

        let mut files = Vec::new();
        if !merge.rows.is_empty() {
            let path = self.paths.data_file(commit_id);
            self.put_new(&path, to_json_bytes(&merge.rows, "data file")?)
                .await?;
            files.push(path);
        }

        let change_file = if self.metadata.properties.change_data_feed && !merge.changes.is_empty()
        {
            Some(self.write_changes(commit_id, &merge.changes).await?)
        } else {
            None
        };

        let pending = PendingCommit {
            commit_id,
            operation: Operation::Merge,
            added: files.clone(),
            files,
            num_rows: merge.rows.len() as u64,
            change_file,
            txn: merge.txn,
            metrics: merge.metrics,
        };

        self.try_commit(&snapshot, pending).await?.ok_or_else(|| {
            metrics::record_commit_conflict(&self.name().to_string());
            TableError::conflict(format!(
                "{} moved past version {} during merge",
                self.name(),
                merge.read_version
            ))
        })
    }

    // === Internals ===

    fn validate_rows(&self, rows: &[Row]) -> Result<()> {
        for (idx, row) in rows.iter().enumerate() {
            self.metadata
                .schema
                .validate_row(row)
                .map_err(|message| TableError::SchemaViolation {
                    table: self.name().to_string(),
                    message: format!("row {idx}: {message}"),
                })?;
        }
        Ok(())
    }

    /// Writes the commit entry for `snapshot.version + 1`.
    ///
    /// Returns `None` if another writer already committed that version.
    async fn try_commit(
        &self,
        snapshot: &TableSnapshot,
        pending: PendingCommit,
    ) -> Result<Option<CommitEntry>> {
        let version = snapshot.version + 1;

        let mut txns = snapshot.txns.clone();
        if let Some(txn) = pending.txn {
            let slot = txns.entry(txn.app_id).or_insert(txn.source_version);
            *slot = (*slot).max(txn.source_version);
        }

        let entry = CommitEntry {
            version,
            commit_id: pending.commit_id,
            operation: pending.operation,
            committed_at: Utc::now(),
            files: pending.files,
            added: pending.added,
            num_rows: pending.num_rows,
            change_file: pending.change_file,
            txns,
            metrics: pending.metrics,
        };

        let put = self
            .storage
            .put_raw(
                &self.paths.log_entry(version),
                to_json_bytes(&entry, "commit entry")?,
                WritePrecondition::DoesNotExist,
            )
            .await?;

        if let WriteResult::PreconditionFailed { .. } = put {
            tracing::debug!(table = %self.name(), version, "lost commit race");
            metrics::record_commit_conflict(&self.name().to_string());
            return Ok(None);
        }

        metrics::record_commit(&self.name().to_string(), &entry.operation.to_string());
        tracing::info!(
            table = %self.name(),
            version,
            operation = %entry.operation,
            rows = entry.metrics.num_output_rows,
            "committed"
        );

        let hint = LastCommitHint { version };
        match to_json_bytes(&hint, "commit hint") {
            Ok(bytes) => {
                if let Err(e) = self
                    .storage
                    .put_raw(&self.paths.last_commit_hint(), bytes, WritePrecondition::None)
                    .await
                {
                    tracing::warn!(table = %self.name(), error = %e, "failed to update commit hint");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode commit hint"),
        }

        Ok(Some(entry))
    }

    async fn write_changes(&self, commit_id: CommitId, changes: &[RowChange]) -> Result<String> {
        let path = self.paths.change_file(commit_id);
        self.put_new(&path, to_json_bytes(&changes, "change file")?)
            .await?;
        Ok(path)
    }

    async fn put_new(&self, path: &str, data: Bytes) -> Result<()> {
        match self
            .storage
            .put_raw(path, data, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(TableError::conflict(format!(
                "file {path} already exists"
            ))),
        }
    }

    pub(crate) async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.storage.get_raw(path).await?;
        from_json_bytes(&bytes, path)
    }

    fn retries_exhausted(&self) -> TableError {
        TableError::conflict(format!(
            "failed to commit to {} after {} attempts",
            self.name(),
            self.config.max_commit_retries
        ))
    }
}

fn table_paths(name: &TableName) -> Result<TablePaths> {
    TablePaths::new(&name.schema, &name.name).map_err(|e| TableError::bad_request(e.to_string()))
}

fn to_json_bytes<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TableError::serialization(format!("failed to serialize {what}: {e}")))
}

fn from_json_bytes<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| TableError::serialization(format!("failed to deserialize {what}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use claims360_core::MemoryBackend;
    use serde_json::json;

    use super::*;
    use crate::schema::{Column, DataType, TableSchema};
    use crate::types::TableProperties;

    fn metadata(cdf: bool) -> TableMetadata {
        let props = if cdf {
            TableProperties::quality("gold").with_change_data_feed()
        } else {
            TableProperties::quality("gold")
        };
        TableMetadata::new(
            "gold.widgets".parse().unwrap(),
            TableSchema::new(vec![
                Column::required("id", DataType::String),
                Column::nullable("qty", DataType::Integer),
            ]),
        )
        .with_properties(props)
    }

    fn storage() -> ScopedStorage {
        ScopedStorage::new(Arc::new(MemoryBackend::new()), "claims360_test").unwrap()
    }

    fn row(id: &str, qty: i64) -> Row {
        json!({"id": id, "qty": qty}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent_and_starts_at_version_zero() {
        let storage = storage();
        let table = Table::create(storage.clone(), metadata(false)).await.unwrap();
        assert_eq!(table.latest_version().await.unwrap(), 0);

        let again = Table::create(storage, metadata(false)).await.unwrap();
        assert_eq!(again.latest_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_rejects_different_metadata() {
        let storage = storage();
        Table::create(storage.clone(), metadata(false)).await.unwrap();
        let err = Table::create(storage, metadata(true)).await.unwrap_err();
        assert!(matches!(err, TableError::Conflict { .. }));
    }

    #[tokio::test]
    async fn open_missing_table_is_not_found() {
        let err = Table::open(storage(), &"gold.nothing".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::NotFound { .. }));
    }

    #[tokio::test]
    async fn overwrite_replaces_contents() {
        let table = Table::create(storage(), metadata(false)).await.unwrap();
        table.overwrite(vec![row("a", 1), row("b", 2)]).await.unwrap();
        let entry = table.overwrite(vec![row("c", 3)]).await.unwrap();

        assert_eq!(entry.version, 2);
        assert_eq!(entry.metrics.num_deleted_rows, 2);
        let snapshot = table.snapshot().await.unwrap();
        let rows = table.read_rows(&snapshot).await.unwrap();
        assert_eq!(rows, vec![row("c", 3)]);
    }

    #[tokio::test]
    async fn append_accumulates_and_honours_txn() {
        let table = Table::create(storage(), metadata(false)).await.unwrap();

        let first = table
            .append(vec![row("a", 1)], Some(StreamTxn::new("loader", 5)))
            .await
            .unwrap();
        assert!(first.is_committed());

        let replay = table
            .append(vec![row("a", 1)], Some(StreamTxn::new("loader", 5)))
            .await
            .unwrap();
        assert_eq!(replay, CommitOutcome::AlreadyApplied { version: 1 });

        table.append(vec![row("b", 2)], None).await.unwrap();
        let snapshot = table.snapshot().await.unwrap();
        assert_eq!(snapshot.txn_version("loader"), Some(5));
        assert_eq!(table.read_rows(&snapshot).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schema_violation_writes_nothing() {
        let table = Table::create(storage(), metadata(false)).await.unwrap();
        let bad = json!({"qty": 1}).as_object().cloned().unwrap();
        let err = table.overwrite(vec![row("a", 1), bad]).await.unwrap_err();
        assert!(matches!(err, TableError::SchemaViolation { .. }));
        assert_eq!(table.latest_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_merge_is_a_conflict() {
        let table = Table::create(storage(), metadata(true)).await.unwrap();
        table.append(vec![row("a", 1)], None).await.unwrap();

        let merge = |read_version| MergeCommit {
            read_version,
            rows: vec![row("a", 2)],
            changes: vec![RowChange::new(ChangeType::UpdatePostimage, row("a", 2))],
            txn: Some(StreamTxn::new("engine", 1)),
            metrics: CommitMetrics::default(),
        };

        table.commit_merge(merge(1)).await.unwrap();
        let err = table.commit_merge(merge(1)).await.unwrap_err();
        assert!(matches!(err, TableError::Conflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(table.latest_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn latest_version_survives_stale_hint() {
        let storage = storage();
        let table = Table::create(storage.clone(), metadata(false)).await.unwrap();
        table.append(vec![row("a", 1)], None).await.unwrap();
        table.append(vec![row("b", 1)], None).await.unwrap();

        storage
            .put_raw(
                &table.paths.last_commit_hint(),
                Bytes::from(r#"{"version":1}"#),
                WritePrecondition::None,
            )
            .await
            .unwrap();
        assert_eq!(table.latest_version().await.unwrap(), 2);

        storage.delete(&table.paths.last_commit_hint()).await.unwrap();
        assert_eq!(table.latest_version().await.unwrap(), 2);
    }
}
