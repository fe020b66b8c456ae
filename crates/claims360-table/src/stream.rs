//! Append-only streaming reads.
//!
//! A stream reader holds a position: the last source version it has fully
//! applied. Each call returns the rows appended after that position, up to a
//! bounded number of versions, together with the version the caller should
//! record once the rows are durably applied.

use crate::error::{Result, TableError};
use crate::table::Table;
use crate::types::{Operation, Row};

/// A streamed row and the version that appended it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRow {
    /// Commit version that appended the row.
    pub version: u64,
    /// The row.
    pub row: Row,
}

/// Rows appended in a contiguous range of versions.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendBatch {
    /// Position the batch was read from (exclusive).
    pub after_version: u64,
    /// Last version included (inclusive). The next position.
    pub end_version: u64,
    /// Rows in commit order, then file order.
    pub rows: Vec<VersionedRow>,
}

impl Table {
    /// Reads appends in `after_version + 1 ..= after_version + max_versions`,
    /// clamped to the latest version.
    ///
    /// Returns `None` if nothing was committed after `after_version`. A batch
    /// may be returned with no rows if the range only holds empty commits.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotAppendOnly`] if the range contains an
    /// overwrite or merge commit; the stream cannot continue past it.
    #[tracing::instrument(skip(self), fields(table = %self.name()))]
    pub async fn read_appends(
        &self,
        after_version: u64,
        max_versions: usize,
    ) -> Result<Option<AppendBatch>> {
        if max_versions == 0 {
            return Err(TableError::bad_request("max_versions must be positive"));
        }

        let latest = self.latest_version().await?;
        if latest <= after_version {
            return Ok(None);
        }

        let span = u64::try_from(max_versions).unwrap_or(u64::MAX);
        let end_version = latest.min(after_version.saturating_add(span));

        let mut rows = Vec::new();
        for version in (after_version + 1)..=end_version {
            let entry = self.commit_entry(version).await?;
            match entry.operation {
                Operation::Append => {
                    for file in &entry.added {
                        let file_rows: Vec<Row> = self.read_json(file).await?;
                        rows.extend(
                            file_rows
                                .into_iter()
                                .map(|row| VersionedRow { version, row }),
                        );
                    }
                }
                Operation::Create => {}
                Operation::Overwrite | Operation::Merge => {
                    return Err(TableError::NotAppendOnly {
                        table: self.name().to_string(),
                        version,
                        operation: entry.operation.to_string(),
                    });
                }
            }
        }

        tracing::debug!(after_version, end_version, rows = rows.len(), "read appends");
        Ok(Some(AppendBatch {
            after_version,
            end_version,
            rows,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use claims360_core::{MemoryBackend, ScopedStorage};
    use serde_json::json;

    use super::*;
    use crate::schema::{Column, DataType, TableSchema};
    use crate::types::TableMetadata;

    async fn source() -> Table {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "claims360_test").unwrap();
        let metadata = TableMetadata::new(
            "silver.remit".parse().unwrap(),
            TableSchema::new(vec![Column::required("remit_id", DataType::String)]),
        );
        Table::create(storage, metadata).await.unwrap()
    }

    fn row(id: &str) -> Row {
        json!({ "remit_id": id }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn reads_bounded_ranges_in_order() {
        let table = source().await;
        for id in ["r1", "r2", "r3"] {
            table.append(vec![row(id)], None).await.unwrap();
        }

        let first = table.read_appends(0, 2).await.unwrap().unwrap();
        assert_eq!(first.end_version, 2);
        assert_eq!(
            first.rows.iter().map(|r| r.row.clone()).collect::<Vec<_>>(),
            vec![row("r1"), row("r2")]
        );
        assert_eq!(
            first.rows.iter().map(|r| r.version).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let second = table.read_appends(first.end_version, 2).await.unwrap().unwrap();
        assert_eq!(second.end_version, 3);
        assert_eq!(second.rows, vec![VersionedRow { version: 3, row: row("r3") }]);

        assert!(table.read_appends(3, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overwrite_breaks_the_stream() {
        let table = source().await;
        table.append(vec![row("r1")], None).await.unwrap();
        table.overwrite(vec![row("r2")]).await.unwrap();

        let err = table.read_appends(0, 10).await.unwrap_err();
        assert!(matches!(err, TableError::NotAppendOnly { version: 2, .. }));
    }
}
