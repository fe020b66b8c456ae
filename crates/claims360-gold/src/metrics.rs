//! Pipeline metrics.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `claims360_micro_batches_total` | Counter | `app_id` |
//! | `claims360_merge_rows_total` | Counter | `app_id`, `outcome` |
//! | `claims360_quarantined_events_total` | Counter | `app_id` |
//! | `claims360_stream_position` | Gauge | `app_id` |
//! | `claims360_refresh_runs_total` | Counter | `table` |
//! | `claims360_refresh_duration_seconds` | Histogram | `table` |
//! | `claims360_stage_failures_total` | Counter | `stage`, `retryable` |
//!
//! Metrics go through the `metrics` facade; installing an exporter is the
//! embedding process's job.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::upsert::MergeCounts;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: committed micro-batches.
    pub const MICRO_BATCHES: &str = "claims360_micro_batches_total";
    /// Counter: merged events by outcome.
    pub const MERGE_ROWS: &str = "claims360_merge_rows_total";
    /// Counter: events written to quarantine.
    pub const QUARANTINED: &str = "claims360_quarantined_events_total";
    /// Gauge: last committed source version.
    pub const STREAM_POSITION: &str = "claims360_stream_position";
    /// Counter: full refresh runs.
    pub const REFRESH_RUNS: &str = "claims360_refresh_runs_total";
    /// Histogram: full refresh duration.
    pub const REFRESH_DURATION: &str = "claims360_refresh_duration_seconds";
    /// Counter: failed stage invocations.
    pub const STAGE_FAILURES: &str = "claims360_stage_failures_total";
}

/// Registers all pipeline metric descriptions, including the table layer's.
pub fn register_metrics() {
    describe_counter!(names::MICRO_BATCHES, "Micro-batches committed to the merge target");
    describe_counter!(names::MERGE_ROWS, "Merged events by outcome");
    describe_counter!(names::QUARANTINED, "Invalid events written to quarantine");
    describe_gauge!(names::STREAM_POSITION, "Last committed source version");
    describe_counter!(names::REFRESH_RUNS, "Full refresh runs committed");
    describe_histogram!(names::REFRESH_DURATION, "Full refresh duration in seconds");
    describe_counter!(names::STAGE_FAILURES, "Failed stage invocations");
    claims360_table::metrics::register_metrics();
}

/// Records a committed micro-batch.
#[allow(clippy::cast_precision_loss)]
pub fn record_micro_batch(app_id: &str, end_version: u64, counts: &MergeCounts) {
    let app = app_id.to_string();
    counter!(names::MICRO_BATCHES, "app_id" => app.clone()).increment(1);
    for (outcome, n) in [
        ("inserted", counts.inserted),
        ("updated", counts.updated),
        ("unchanged", counts.unchanged),
        ("discarded_late", counts.discarded_late),
        ("superseded", counts.superseded),
    ] {
        if n > 0 {
            counter!(names::MERGE_ROWS, "app_id" => app.clone(), "outcome" => outcome).increment(n);
        }
    }
    if counts.quarantined > 0 {
        counter!(names::QUARANTINED, "app_id" => app.clone()).increment(counts.quarantined);
    }
    gauge!(names::STREAM_POSITION, "app_id" => app).set(end_version as f64);
}

/// Records a committed full refresh.
pub fn record_refresh(table: &str, elapsed: Duration) {
    counter!(names::REFRESH_RUNS, "table" => table.to_string()).increment(1);
    histogram!(names::REFRESH_DURATION, "table" => table.to_string()).record(elapsed.as_secs_f64());
}

/// Records a failed stage invocation.
pub fn record_stage_failure(stage: &str, retryable: bool) {
    counter!(
        names::STAGE_FAILURES,
        "stage" => stage.to_string(),
        "retryable" => retryable.to_string()
    )
    .increment(1);
}
