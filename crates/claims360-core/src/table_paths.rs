//! Typed path helpers for table artifacts.
//!
//! Layout (scope-relative, see [`crate::ScopedStorage`]):
//!
//! ```text
//! tables/{schema}/{table}/_metadata.json
//! tables/{schema}/{table}/_log/{version:020}.json
//! tables/{schema}/{table}/_last_commit.json
//! tables/{schema}/{table}/data/{commit_id}.json
//! tables/{schema}/{table}/_change_data/{commit_id}.json
//! ```

use crate::error::Result;
use crate::id::CommitId;
use crate::scoped_storage::validate_id;

/// Typed paths for a single table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    /// Creates typed paths for `schema.table`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidId`] if either segment is not a valid id.
    pub fn new(schema: &str, table: &str) -> Result<Self> {
        validate_id(schema, "schema")?;
        validate_id(table, "table")?;
        Ok(Self {
            root: format!("tables/{schema}/{table}"),
        })
    }

    /// Returns the scope-relative table root.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Table metadata (schema + properties), written once at creation.
    #[must_use]
    pub fn metadata(&self) -> String {
        format!("{}/_metadata.json", self.root)
    }

    /// Commit log entry for `version`. Writing it is the commit point.
    #[must_use]
    pub fn log_entry(&self, version: u64) -> String {
        format!("{}/_log/{version:020}.json", self.root)
    }

    /// Best-effort pointer to the latest known commit version.
    #[must_use]
    pub fn last_commit_hint(&self) -> String {
        format!("{}/_last_commit.json", self.root)
    }

    /// Data file written by `commit_id`.
    #[must_use]
    pub fn data_file(&self, commit_id: CommitId) -> String {
        format!("{}/data/{commit_id}.json", self.root)
    }

    /// Change-feed file written by `commit_id`.
    #[must_use]
    pub fn change_file(&self, commit_id: CommitId) -> String {
        format!("{}/_change_data/{commit_id}.json", self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_match_layout() {
        let paths = TablePaths::new("gold", "fact_denial_event").unwrap();
        assert_eq!(
            paths.metadata(),
            "tables/gold/fact_denial_event/_metadata.json"
        );
        assert_eq!(
            paths.log_entry(7),
            "tables/gold/fact_denial_event/_log/00000000000000000007.json"
        );
        assert_eq!(
            paths.last_commit_hint(),
            "tables/gold/fact_denial_event/_last_commit.json"
        );
        let commit = CommitId::generate();
        assert_eq!(
            paths.data_file(commit),
            format!("tables/gold/fact_denial_event/data/{commit}.json")
        );
    }

    #[test]
    fn rejects_invalid_segments() {
        assert!(TablePaths::new("Gold", "t").is_err());
        assert!(TablePaths::new("gold", "../t").is_err());
    }
}
