//! Incremental upsert engine (CDC merge into `gold.fact_denial_event`).
//!
//! One micro-batch:
//! 1) Read the target snapshot; the stream position is its transaction
//!    marker for the configured app id.
//! 2) Read the next appends from the event source.
//! 3) Load the Claim Fact lookup and enrich the batch.
//! 4) Quarantine or reject invalid events, per policy.
//! 5) Reduce per key, apply the upsert state machine to the index.
//! 6) Commit rows, change records and the new position in one merge commit.
//!
//! A failure anywhere before step 6 completes leaves both the target and the
//! position untouched, so the batch is simply read again.

use claims360_table::{AppendBatch, MergeCommit, StreamTxn, Table, TableError, TableSnapshot};

use crate::config::InvalidEventPolicy;
use crate::context::ExecutionContext;
use crate::enrichment::{ClaimLookup, InvalidEvent, enrich_batch};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::to_row;
use crate::tables::PipelineTables;
use crate::upsert::{MergeCounts, TargetIndex, plan_merge, reduce_batch};

/// Outcome of one committed micro-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Position before the batch (exclusive).
    pub after_version: u64,
    /// Position after the batch (inclusive).
    pub end_version: u64,
    /// Target version that committed the batch.
    pub target_version: u64,
    /// Claim Fact version used for enrichment.
    pub lookup_version: u64,
    /// Outcome counts.
    pub counts: MergeCounts,
}

/// Outcome of draining the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Committed micro-batches.
    pub batches: Vec<BatchReport>,
    /// Final stream position.
    pub position: u64,
}

impl DrainReport {
    /// Sums the counts of every batch.
    #[must_use]
    pub fn totals(&self) -> MergeCounts {
        self.batches.iter().fold(MergeCounts::default(), |mut acc, b| {
            acc.inserted += b.counts.inserted;
            acc.updated += b.counts.updated;
            acc.unchanged += b.counts.unchanged;
            acc.discarded_late += b.counts.discarded_late;
            acc.superseded += b.counts.superseded;
            acc.quarantined += b.counts.quarantined;
            acc.filtered += b.counts.filtered;
            acc
        })
    }
}

/// Single-writer merge engine.
///
/// Holds an index of the target that is rebuilt whenever the committed
/// target version differs from the one it was built at.
#[derive(Debug)]
pub struct ApplyChangesEngine {
    ctx: ExecutionContext,
    source: Table,
    lookup: Table,
    target: Table,
    quarantine: Table,
    index: Option<TargetIndex>,
}

impl ApplyChangesEngine {
    /// Creates an engine over the pipeline tables.
    #[must_use]
    pub fn new(ctx: ExecutionContext, tables: &PipelineTables) -> Self {
        Self {
            ctx,
            source: tables.payment_events.clone(),
            lookup: tables.fact_claim.clone(),
            target: tables.fact_denial_event.clone(),
            quarantine: tables.quarantine.clone(),
            index: None,
        }
    }

    fn app_id(&self) -> &str {
        &self.ctx.config().app_id
    }

    /// Returns the committed stream position (0 before the first batch).
    ///
    /// # Errors
    ///
    /// Returns storage errors reading the target.
    pub async fn position(&self) -> Result<u64> {
        Ok(self.target.txn_version(self.app_id()).await?.unwrap_or(0))
    }

    /// Runs one micro-batch.
    ///
    /// Returns `None` when the source has nothing after the committed
    /// position.
    ///
    /// # Errors
    ///
    /// - [`Error::SourceUnavailable`] if the event source or the Claim Fact
    ///   lookup cannot be read (retryable)
    /// - [`Error::InvalidEvents`] under the `fail` policy
    /// - a table conflict if another writer committed to the target
    /// - [`TableError::NotAppendOnly`] if the source was rewritten
    #[tracing::instrument(skip(self), fields(app_id = %self.app_id()))]
    pub async fn run_micro_batch(&mut self) -> Result<Option<BatchReport>> {
        let snapshot = self.target.snapshot().await?;
        let position = snapshot.txn_version(self.app_id()).unwrap_or(0);

        let Some(batch) = self.read_source(position).await? else {
            tracing::debug!(position, "caught up");
            return Ok(None);
        };

        let lookup = ClaimLookup::load(&self.lookup).await?;
        let enriched = enrich_batch(&batch.rows, &lookup);
        let quarantined = self.handle_invalid(&batch, &enriched.invalid).await?;

        let (events, superseded) = reduce_batch(enriched.events);
        let index = self.index_at(&snapshot).await?;
        let mut plan = plan_merge(index, events)?;
        plan.counts.superseded = superseded;
        plan.counts.quarantined = quarantined;
        plan.counts.filtered = enriched.filtered as u64;

        let commit = MergeCommit {
            read_version: snapshot.version,
            rows: plan.index.to_rows(),
            changes: std::mem::take(&mut plan.changes),
            txn: Some(StreamTxn::new(self.app_id(), batch.end_version)),
            metrics: plan.commit_metrics(),
        };
        let entry = self.target.commit_merge(commit).await?;
        self.index = Some(plan.index.at_version(entry.version));

        metrics::record_micro_batch(self.app_id(), batch.end_version, &plan.counts);
        tracing::info!(
            after_version = batch.after_version,
            end_version = batch.end_version,
            target_version = entry.version,
            lookup_version = lookup.version(),
            inserted = plan.counts.inserted,
            updated = plan.counts.updated,
            unchanged = plan.counts.unchanged,
            discarded_late = plan.counts.discarded_late,
            quarantined = plan.counts.quarantined,
            "micro-batch committed"
        );

        Ok(Some(BatchReport {
            after_version: batch.after_version,
            end_version: batch.end_version,
            target_version: entry.version,
            lookup_version: lookup.version(),
            counts: plan.counts,
        }))
    }

    /// Runs micro-batches until the source is drained.
    ///
    /// # Errors
    ///
    /// Returns the first micro-batch error; earlier batches stay committed.
    pub async fn drain(&mut self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        while let Some(batch) = self.run_micro_batch().await? {
            report.batches.push(batch);
        }
        report.position = self.position().await?;
        Ok(report)
    }

    async fn read_source(&self, position: u64) -> Result<Option<AppendBatch>> {
        self.source
            .read_appends(position, self.ctx.config().max_versions_per_batch)
            .await
            .map_err(|e| match e {
                TableError::NotAppendOnly { .. } => Error::Table(e),
                other => Error::source_unavailable(self.source.name().to_string(), other),
            })
    }

    /// Returns the index at the snapshot's version, rebuilding it if needed.
    async fn index_at(&mut self, snapshot: &TableSnapshot) -> Result<&TargetIndex> {
        let stale = self
            .index
            .as_ref()
            .is_none_or(|index| index.version() != snapshot.version);
        if stale {
            let rows = self.target.read_rows(snapshot).await?;
            let index = TargetIndex::from_rows(
                &self.target.name().to_string(),
                snapshot.version,
                rows,
            )?;
            tracing::debug!(version = snapshot.version, keys = index.len(), "rebuilt target index");
            self.index = Some(index);
        }
        self.index.as_ref().ok_or_else(|| Error::CorruptTarget {
            table: self.target.name().to_string(),
            message: "index unavailable after rebuild".to_string(),
        })
    }

    async fn handle_invalid(&self, batch: &AppendBatch, invalid: &[InvalidEvent]) -> Result<u64> {
        let Some(first) = invalid.first() else {
            return Ok(0);
        };

        match self.ctx.config().invalid_event_policy {
            InvalidEventPolicy::Fail => Err(Error::InvalidEvents {
                count: invalid.len(),
                after_version: batch.after_version,
                end_version: batch.end_version,
                first: first.reason.to_string(),
            }),
            InvalidEventPolicy::Quarantine => {
                let marker = self
                    .quarantine
                    .txn_version(self.app_id())
                    .await?
                    .unwrap_or(0);
                let rows = invalid
                    .iter()
                    .filter(|e| e.source_version > marker)
                    .map(|e| to_row(&e.to_quarantine()))
                    .collect::<Result<Vec<_>>>()?;
                if !rows.is_empty() {
                    let count = rows.len();
                    let outcome = self
                        .quarantine
                        .append(rows, Some(StreamTxn::new(self.app_id(), batch.end_version)))
                        .await?;
                    tracing::warn!(
                        count,
                        quarantine_version = outcome.version(),
                        "quarantined invalid denial events"
                    );
                }
                Ok(invalid.len() as u64)
            }
        }
    }
}
