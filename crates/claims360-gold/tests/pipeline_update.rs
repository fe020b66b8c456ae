//! End-to-end pipeline tests over the local filesystem backend.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use claims360_core::{LocalFsBackend, MemoryBackend, ScopedStorage, StorageBackend};
use claims360_gold::event_key::event_key;
use claims360_gold::model::{ClaimFact, DenialEvent, UNKNOWN_PAYER};
use claims360_gold::pipeline::gold_stages;
use claims360_gold::{
    Error, ExecutionContext, Pipeline, PipelineConfig, PipelineTables, StageKind,
};
use claims360_table::{ChangeType, Row, Table};
use serde_json::{Value, json};
use tempfile::TempDir;

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn local_storage(dir: &TempDir) -> ScopedStorage {
    let backend: Arc<dyn StorageBackend> = Arc::new(LocalFsBackend::new(dir.path()).unwrap());
    ScopedStorage::new(backend, "claims360_dev").unwrap()
}

async fn open_pipeline(storage: ScopedStorage) -> (Pipeline, PipelineTables) {
    let tables = PipelineTables::ensure(&storage).await.unwrap();
    let ctx = ExecutionContext::new(storage, PipelineConfig::default());
    (Pipeline::new(ctx, &tables).unwrap(), tables)
}

fn denial(remit: &str, claim: &str, posted: &str, reason: &str) -> Row {
    row(json!({
        "remit_id": remit,
        "claim_id": claim,
        "payer_id": "P-EVENT",
        "check_or_eft_trace": "EFT-1",
        "posted_ts": posted,
        "payment_date": "2024-01-01",
        "payment_amount": "0.00",
        "adjustment_amount": "125.00",
        "reason_code": reason,
        "reason_category": "CO",
        "is_denial": 1,
    }))
}

async fn denials(tables: &PipelineTables) -> Vec<DenialEvent> {
    let (_, mut rows) = tables.fact_denial_event.read_as::<DenialEvent>().await.unwrap();
    rows.sort_by(|a, b| a.remit_id.cmp(&b.remit_id));
    rows
}

#[tokio::test]
async fn update_refreshes_facts_then_merges_enriched_denials() {
    let dir = TempDir::new().unwrap();
    let (mut pipeline, tables) = open_pipeline(local_storage(&dir)).await;

    tables
        .curated_claims
        .append(
            vec![row(json!({
                "claim_id": "C1",
                "payer_id": "P-FACT",
                "payer_name": "Acme Health",
                "billed_amount": 250,
            }))],
            None,
        )
        .await
        .unwrap();
    tables
        .payment_events
        .append(
            vec![
                denial("R1", "C1", "2024-01-01T00:00Z", "50"),
                denial("R2", "C9", "2024-01-02T00:00Z", "97"),
            ],
            None,
        )
        .await
        .unwrap();

    let report = pipeline.update().await.unwrap();
    assert_eq!(report.refresh.unwrap().rows, 1);
    let merged = report.apply_changes.unwrap();
    assert_eq!(merged.position, 1);
    assert_eq!(merged.totals().inserted, 2);

    let rows = denials(&tables).await;
    assert_eq!(rows.len(), 2);

    assert_eq!(
        rows[0].event_key,
        event_key(Some("R1"), Some("C1"), Some("2024-01-01 00:00:00"), Some("50"))
    );
    assert_eq!(rows[0].payer_id.as_deref(), Some("P-FACT"));
    assert_eq!(rows[0].payer_name, "Acme Health");
    assert_eq!(rows[0].adjustment_amount, Some("125.00".parse().unwrap()));

    // Lookup miss: the event's own payer id, and the unknown payer name.
    assert_eq!(rows[1].payer_id.as_deref(), Some("P-EVENT"));
    assert_eq!(rows[1].payer_name, UNKNOWN_PAYER);
}

#[tokio::test]
async fn same_event_in_two_batches_leaves_one_row() {
    let dir = TempDir::new().unwrap();
    let (mut pipeline, tables) = open_pipeline(local_storage(&dir)).await;

    for _ in 0..2 {
        tables
            .payment_events
            .append(vec![denial("R1", "C1", "2024-01-01T00:00Z", "50")], None)
            .await
            .unwrap();
        pipeline.update().await.unwrap();
    }

    let rows = denials(&tables).await;
    assert_eq!(rows.len(), 1);

    let changes = tables.fact_denial_event.read_changes(1, None).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::Insert);
    assert_eq!(tables.fact_denial_event.latest_version().await.unwrap(), 2);
}

#[tokio::test]
async fn repeated_refresh_writes_identical_bytes() {
    let dir = TempDir::new().unwrap();
    let storage = local_storage(&dir);
    let (pipeline, tables) = open_pipeline(storage.clone()).await;

    tables
        .curated_claims
        .append(
            vec![
                row(json!({"claim_id": "C2", "billed_amount": "10.10", "had_277_reject": false})),
                row(json!({"claim_id": "C1", "current_balance": 5, "last_payment_ts": "2024-03-01T12:00:00Z"})),
            ],
            None,
        )
        .await
        .unwrap();

    let first = pipeline.refresh().await.unwrap();
    let second = pipeline.refresh().await.unwrap();
    assert_eq!(second.version, first.version + 1);

    let mut files = Vec::new();
    for version in [first.version, second.version] {
        let entry = tables.fact_claim.commit_entry(version).await.unwrap();
        assert_eq!(entry.files.len(), 1);
        files.push(storage.get_raw(&entry.files[0]).await.unwrap());
    }
    assert_eq!(files[0], files[1]);

    let (_, facts) = tables.fact_claim.read_as::<ClaimFact>().await.unwrap();
    assert_eq!(
        facts.iter().map(|f| f.claim_id.as_str()).collect::<Vec<_>>(),
        vec!["C1", "C2"]
    );
}

#[tokio::test]
async fn state_survives_reopening_the_store() {
    let dir = TempDir::new().unwrap();
    {
        let (mut pipeline, tables) = open_pipeline(local_storage(&dir)).await;
        tables
            .payment_events
            .append(vec![denial("R1", "C1", "2024-01-01T00:00Z", "50")], None)
            .await
            .unwrap();
        pipeline.update().await.unwrap();
    }

    let storage = local_storage(&dir);
    let target = Table::open(storage.clone(), &"gold.fact_denial_event".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(target.txn_version("fact_denial_event").await.unwrap(), Some(1));

    let (mut pipeline, tables) = open_pipeline(storage).await;
    tables
        .payment_events
        .append(vec![denial("R7", "C7", "2024-01-07T00:00Z", "50")], None)
        .await
        .unwrap();
    let report = pipeline.apply_changes().await.unwrap();
    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.batches[0].after_version, 1);
    assert_eq!(denials(&tables).await.len(), 2);
}

#[tokio::test]
async fn continuous_mode_stops_on_shutdown() {
    let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "claims360_dev").unwrap();
    let tables = PipelineTables::ensure(&storage).await.unwrap();
    tables
        .payment_events
        .append(vec![denial("R1", "C1", "2024-01-01T00:00Z", "50")], None)
        .await
        .unwrap();

    let config = PipelineConfig {
        refresh_interval: Duration::from_millis(20),
        stream_interval: Duration::from_millis(5),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(ExecutionContext::new(storage, config), &tables).unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        pipeline.run_continuous(tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("pipeline did not stop")
    .unwrap();

    assert_eq!(denials(&tables).await.len(), 1);
    assert!(tables.fact_claim.latest_version().await.unwrap() >= 1);
}

#[tokio::test]
async fn zero_interval_is_rejected_before_starting() {
    let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "claims360_dev").unwrap();
    let tables = PipelineTables::ensure(&storage).await.unwrap();
    let config = PipelineConfig {
        stream_interval: Duration::ZERO,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(ExecutionContext::new(storage, config), &tables).unwrap();

    let err = pipeline
        .run_continuous(std::future::pending::<()>())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config { .. }), "{err}");
}

#[tokio::test]
async fn only_source_tables_accept_external_appends() {
    let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "claims360_dev").unwrap();
    let tables = PipelineTables::ensure(&storage).await.unwrap();

    let declared: Vec<String> = gold_stages()
        .into_iter()
        .filter(|s| s.kind == StageKind::Source)
        .map(|s| s.name)
        .collect();
    let sources: Vec<String> = tables.sources().iter().map(|t| t.name().to_string()).collect();
    assert_eq!(sources, declared);

    for gold in ["gold.fact_claim", "gold.fact_denial_event", "gold.denial_event_quarantine"] {
        assert!(tables.source_by_name(gold).is_none(), "{gold}");
    }
    assert!(tables.source_by_name("silver.payments_835_events").is_some());
}
