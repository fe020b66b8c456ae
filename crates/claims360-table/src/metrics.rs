//! Table commit metrics.
//!
//! Counters complement the structured logs emitted by each commit.

use metrics::{counter, describe_counter};

// ============================================================================
// Commit Metrics
// ============================================================================

/// Committed versions, labelled by table and operation.
pub const COMMITS: &str = "claims360_table_commits_total";

/// Lost commit races (blind-write rebases and merge conflicts).
pub const COMMIT_CONFLICTS: &str = "claims360_table_commit_conflicts_total";

/// Registers all table metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(COMMITS, "Total versions committed");
    describe_counter!(COMMIT_CONFLICTS, "Total commit attempts that lost a version race");
}

/// Records a successful commit.
pub fn record_commit(table: &str, operation: &str) {
    counter!(
        COMMITS,
        "table" => table.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Records a lost commit race.
pub fn record_commit_conflict(table: &str) {
    counter!(COMMIT_CONFLICTS, "table" => table.to_string()).increment(1);
}
