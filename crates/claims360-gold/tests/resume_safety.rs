//! Merge engine failure tests: storage faults injected mid-batch, then a
//! restarted engine compared against an uninterrupted run.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use claims360_core::error::Result as CoreResult;
use claims360_core::{
    Error as CoreError, MemoryBackend, ObjectMeta, ScopedStorage, StorageBackend,
    WritePrecondition, WriteResult,
};
use claims360_gold::{ApplyChangesEngine, Error, ExecutionContext, PipelineConfig, PipelineTables};
use claims360_table::{Row, TableError};
use serde_json::{Value, json};

/// Fails the next `n` gets or puts whose path contains a marker.
#[derive(Default)]
struct FaultyBackend {
    inner: MemoryBackend,
    put_faults: Mutex<HashMap<String, usize>>,
    get_faults: Mutex<HashMap<String, usize>>,
}

impl FaultyBackend {
    fn fail_puts(&self, marker: &str, times: usize) {
        self.put_faults.lock().unwrap().insert(marker.to_string(), times);
    }

    fn fail_gets(&self, marker: &str, times: usize) {
        self.get_faults.lock().unwrap().insert(marker.to_string(), times);
    }

    fn take(faults: &Mutex<HashMap<String, usize>>, path: &str) -> bool {
        let mut faults = faults.lock().unwrap();
        faults
            .iter_mut()
            .find(|(marker, remaining)| **remaining > 0 && path.contains(marker.as_str()))
            .map(|(_, remaining)| *remaining -= 1)
            .is_some()
    }
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    async fn get(&self, path: &str) -> CoreResult<Bytes> {
        if Self::take(&self.get_faults, path) {
            return Err(CoreError::storage(format!("injected failure reading {path}")));
        }
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> CoreResult<WriteResult> {
        if Self::take(&self.put_faults, path) {
            return Err(CoreError::storage(format!("injected failure writing {path}")));
        }
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMeta>> {
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> CoreResult<Option<ObjectMeta>> {
        self.inner.head(path).await
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        max_versions_per_batch: 1,
        ..PipelineConfig::default()
    }
}

async fn setup(backend: Arc<dyn StorageBackend>) -> (ExecutionContext, PipelineTables) {
    let storage = ScopedStorage::new(backend, "claims360_test").unwrap();
    let tables = PipelineTables::ensure(&storage).await.unwrap();
    (ExecutionContext::new(storage, config()), tables)
}

fn event(remit: &str, claim: Value, posted: &str, amount: &str) -> Row {
    json!({
        "remit_id": remit,
        "claim_id": claim,
        "payer_id": "P-EVENT",
        "posted_ts": posted,
        "payment_amount": amount,
        "reason_code": "50",
        "reason_category": "CO",
        "is_denial": true,
    })
    .as_object()
    .cloned()
    .unwrap()
}

/// Source commits: overlapping keys, redeliveries, an invalid event and a
/// non-denial row.
fn source_commits() -> Vec<Vec<Row>> {
    vec![
        vec![
            event("R1", json!("C1"), "2024-01-01T00:00Z", "0"),
            event("R2", json!("C2"), "2024-01-02T08:30:00Z", "0"),
        ],
        vec![
            event("R1", json!("C1"), "2024-01-01T00:00Z", "0"),
            event("R3", Value::Null, "2024-01-03T00:00Z", "0"),
            event("R6", json!("C6"), "2024-01-06T00:00Z", "7"),
        ],
        vec![
            event("R2", json!("C2"), "2024-01-02 08:30:00", "12.50"),
            {
                let mut paid = event("R4", json!("C4"), "2024-01-04T00:00Z", "80");
                paid.insert("is_denial".into(), json!(false));
                paid
            },
        ],
        vec![event("R5", json!("C5"), "2024-01-05T00:00:00.250Z", "3")],
    ]
}

async fn load_source(tables: &PipelineTables) {
    for rows in source_commits() {
        tables.payment_events.append(rows, None).await.unwrap();
    }
}

async fn target_rows(tables: &PipelineTables) -> Vec<Row> {
    let snapshot = tables.fact_denial_event.snapshot().await.unwrap();
    let mut rows = tables.fact_denial_event.read_rows(&snapshot).await.unwrap();
    rows.sort_by(|a, b| a["event_key"].as_str().cmp(&b["event_key"].as_str()));
    rows
}

async fn quarantine_rows(tables: &PipelineTables) -> Vec<Row> {
    let snapshot = tables.quarantine.snapshot().await.unwrap();
    tables.quarantine.read_rows(&snapshot).await.unwrap()
}

async fn uninterrupted() -> (Vec<Row>, Vec<Row>, u64) {
    let (ctx, tables) = setup(Arc::new(MemoryBackend::new())).await;
    load_source(&tables).await;
    let report = ApplyChangesEngine::new(ctx, &tables).drain().await.unwrap();
    (
        target_rows(&tables).await,
        quarantine_rows(&tables).await,
        report.position,
    )
}

async fn interrupted_at(marker: &str) {
    let backend = Arc::new(FaultyBackend::default());
    let (ctx, tables) = setup(backend.clone()).await;
    load_source(&tables).await;

    let mut engine = ApplyChangesEngine::new(ctx.clone(), &tables);
    engine.run_micro_batch().await.unwrap().unwrap();

    backend.fail_puts(marker, 1);
    let err = engine.run_micro_batch().await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(engine.position().await.unwrap(), 1);
    assert_eq!(tables.fact_denial_event.latest_version().await.unwrap(), 1);

    // Restart: a fresh engine rebuilds its state from storage.
    let mut restarted = ApplyChangesEngine::new(ctx, &tables);
    let report = restarted.drain().await.unwrap();

    let (rows, quarantined, position) = uninterrupted().await;
    assert_eq!(report.position, position);
    assert_eq!(target_rows(&tables).await, rows);
    assert_eq!(quarantine_rows(&tables).await, quarantined);
}

#[tokio::test]
async fn failed_commit_point_then_restart_matches_uninterrupted_run() {
    interrupted_at("gold/fact_denial_event/_log/").await;
}

#[tokio::test]
async fn failed_data_write_then_restart_matches_uninterrupted_run() {
    interrupted_at("gold/fact_denial_event/data/").await;
}

#[tokio::test]
async fn failed_change_file_then_restart_matches_uninterrupted_run() {
    interrupted_at("gold/fact_denial_event/_change_data/").await;
}

#[tokio::test]
async fn uninterrupted_run_has_expected_shape() {
    let (rows, quarantined, position) = uninterrupted().await;
    assert_eq!(position, 4);
    // R1 twice, R2 with two renderings of the same instant, R5, R6. R3 is
    // quarantined and R4 is not a denial.
    assert_eq!(rows.len(), 4);
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0]["reason"], "claim_id is null");

    let r2 = rows.iter().find(|r| r["remit_id"] == "R2").unwrap();
    assert_eq!(r2["payment_amount"], "12.50");
}

#[tokio::test]
async fn lookup_outage_is_retryable_and_moves_nothing() {
    let backend = Arc::new(FaultyBackend::default());
    let (ctx, tables) = setup(backend.clone()).await;
    load_source(&tables).await;
    let mut engine = ApplyChangesEngine::new(ctx, &tables);

    backend.fail_gets("gold/fact_claim/_log/", 1);
    let err = engine.run_micro_batch().await.unwrap_err();
    assert!(
        matches!(&err, Error::SourceUnavailable { table, .. } if table == "gold.fact_claim"),
        "{err}"
    );
    assert!(err.is_retryable());
    assert_eq!(engine.position().await.unwrap(), 0);
    assert_eq!(tables.fact_denial_event.latest_version().await.unwrap(), 0);

    let report = engine.run_micro_batch().await.unwrap().unwrap();
    assert_eq!(report.end_version, 1);
    assert_eq!(report.counts.inserted, 2);
}

#[tokio::test]
async fn event_source_outage_is_retryable() {
    let backend = Arc::new(FaultyBackend::default());
    let (ctx, tables) = setup(backend.clone()).await;
    load_source(&tables).await;
    let mut engine = ApplyChangesEngine::new(ctx, &tables);

    backend.fail_gets("silver/payments_835_events/data/", 1);
    let err = engine.run_micro_batch().await.unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable { .. }));
    assert_eq!(engine.drain().await.unwrap().position, 4);
}

#[tokio::test]
async fn rewritten_source_stops_the_stream() {
    let (ctx, tables) = setup(Arc::new(MemoryBackend::new())).await;
    load_source(&tables).await;
    let mut engine = ApplyChangesEngine::new(ctx, &tables);
    engine.drain().await.unwrap();

    tables
        .payment_events
        .overwrite(vec![event("R9", json!("C9"), "2024-02-01T00:00Z", "1")])
        .await
        .unwrap();
    let err = engine.run_micro_batch().await.unwrap_err();
    assert!(matches!(err, Error::Table(TableError::NotAppendOnly { version: 5, .. })));
    assert!(!err.is_retryable());
    assert_eq!(engine.position().await.unwrap(), 4);
}

#[tokio::test]
async fn second_engine_resumes_from_committed_marker() {
    let (ctx, tables) = setup(Arc::new(MemoryBackend::new())).await;
    load_source(&tables).await;
    let mut first = ApplyChangesEngine::new(ctx.clone(), &tables);
    let mut second = ApplyChangesEngine::new(ctx, &tables);

    first.run_micro_batch().await.unwrap().unwrap();
    // Positions are read from the target, not held by the engine.
    let report = second.run_micro_batch().await.unwrap().unwrap();
    assert_eq!(report.after_version, 1);
    assert_eq!(first.drain().await.unwrap().position, 4);
    assert_eq!(target_rows(&tables).await, uninterrupted().await.0);
}
