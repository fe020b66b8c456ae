//! Full-refresh materializer for `gold.fact_claim`.
//!
//! Each run reads one committed snapshot of `silver.curated_claims`, projects
//! the fixed column set and replaces the target contents in a single
//! overwrite commit. A failed run commits nothing.

use std::time::Instant;

use claims360_table::{Table, TableError};

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{ClaimFact, to_row};
use crate::tables::PipelineTables;

/// Outcome of one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    /// Source version that was read.
    pub source_version: u64,
    /// Target version that committed the new contents.
    pub version: u64,
    /// Rows written.
    pub rows: usize,
}

/// Recomputes `gold.fact_claim` from `silver.curated_claims`.
#[derive(Debug, Clone)]
pub struct FactClaimMaterializer {
    ctx: ExecutionContext,
    source: Table,
    target: Table,
}

impl FactClaimMaterializer {
    /// Creates a materializer over the pipeline tables.
    #[must_use]
    pub fn new(ctx: ExecutionContext, tables: &PipelineTables) -> Self {
        Self {
            ctx,
            source: tables.curated_claims.clone(),
            target: tables.fact_claim.clone(),
        }
    }

    /// Runs one full refresh.
    ///
    /// Output rows are ordered by `claim_id`, ties in source order, so an
    /// unchanged source produces byte-identical data.
    ///
    /// # Errors
    ///
    /// - [`Error::SourceUnavailable`] if the curated snapshot cannot be read
    /// - a table error if a curated row does not project or the overwrite
    ///   fails; the target keeps its previous contents
    #[tracing::instrument(skip(self), fields(run_id = %self.ctx.run_id()))]
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let started = Instant::now();

        let (snapshot, mut facts) = self
            .source
            .read_as::<ClaimFact>()
            .await
            .map_err(|e| match e {
                TableError::Serialization { .. } => Error::Table(e),
                other => Error::source_unavailable(self.source.name().to_string(), other),
            })?;
        facts.sort_by(|a, b| a.claim_id.cmp(&b.claim_id));

        let rows = facts.iter().map(to_row).collect::<Result<Vec<_>>>()?;
        let count = rows.len();
        let entry = self.target.overwrite(rows).await?;

        metrics::record_refresh(&self.target.name().to_string(), started.elapsed());
        tracing::info!(
            source_version = snapshot.version,
            target_version = entry.version,
            rows = count,
            replaced = entry.metrics.num_deleted_rows,
            "claim fact refreshed"
        );

        Ok(RefreshReport {
            source_version: snapshot.version,
            version: entry.version,
            rows: count,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use claims360_core::{MemoryBackend, ScopedStorage};
    use claims360_table::Row;
    use serde_json::json;

    use super::*;
    use crate::config::PipelineConfig;

    async fn setup() -> (FactClaimMaterializer, PipelineTables) {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "claims360_test").unwrap();
        let tables = PipelineTables::ensure(&storage).await.unwrap();
        let ctx = ExecutionContext::new(storage, PipelineConfig::default());
        (FactClaimMaterializer::new(ctx, &tables), tables)
    }

    fn curated(claim: &str, payer: &str, billed: &str) -> Row {
        json!({
            "claim_id": claim,
            "payer_id": payer,
            "payer_name": format!("{payer} Health"),
            "billed_amount": billed,
            "has_denial_any": 1,
            "_ingest_file": "curated/part-0.json",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn projects_and_sorts_by_claim_id() {
        let (materializer, tables) = setup().await;
        tables
            .curated_claims
            .append(vec![curated("C2", "P2", "10.50"), curated("C1", "P1", "99")], None)
            .await
            .unwrap();

        let report = materializer.refresh().await.unwrap();
        assert_eq!(report.rows, 2);
        assert_eq!(report.source_version, 1);

        let (_, facts) = tables.fact_claim.read_as::<ClaimFact>().await.unwrap();
        assert_eq!(facts[0].claim_id, "C1");
        assert_eq!(facts[1].billed_amount, Some("10.50".parse().unwrap()));
        assert_eq!(facts[1].has_denial_any, Some(true));

        let snapshot = tables.fact_claim.snapshot().await.unwrap();
        let rows = tables.fact_claim.read_rows(&snapshot).await.unwrap();
        assert!(rows.iter().all(|r| !r.contains_key("_ingest_file")));
    }

    #[tokio::test]
    async fn refresh_replaces_previous_contents() {
        let (materializer, tables) = setup().await;
        tables
            .curated_claims
            .append(vec![curated("C1", "P1", "1")], None)
            .await
            .unwrap();
        materializer.refresh().await.unwrap();

        tables
            .curated_claims
            .overwrite(vec![curated("C9", "P9", "2")])
            .await
            .unwrap();
        let report = materializer.refresh().await.unwrap();
        assert_eq!(report.version, 2);

        let (_, facts) = tables.fact_claim.read_as::<ClaimFact>().await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].claim_id, "C9");
    }

    #[tokio::test]
    async fn empty_source_empties_target() {
        let (materializer, tables) = setup().await;
        let report = materializer.refresh().await.unwrap();
        assert_eq!(report.rows, 0);
        let (_, facts) = tables.fact_claim.read_as::<ClaimFact>().await.unwrap();
        assert!(facts.is_empty());
    }
}
