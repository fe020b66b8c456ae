//! Stage graph and in-process orchestrator.
//!
//! The Gold layer is declared as stage descriptors. The orchestrator
//! resolves their inputs into a dependency graph and runs the stages that
//! produce tables in topological order: one `update` runs each once, and
//! continuous mode runs the materializer and the merge engine on their own
//! intervals until shutdown.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::Instrument;

use crate::apply_changes::{ApplyChangesEngine, DrainReport};
use crate::context::ExecutionContext;
use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::materializer::{FactClaimMaterializer, RefreshReport};
use crate::metrics;
use crate::tables::{CURATED_CLAIMS, FACT_CLAIM, FACT_DENIAL_EVENT, PAYMENT_EVENTS, PipelineTables};

/// Name of the enrichment view stage.
pub const DENIAL_EVENTS_ENRICHED: &str = "denial_events_enriched";

/// What a stage is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Table produced outside this pipeline.
    Source,
    /// Computed on read, never stored.
    View,
    /// Stored, recomputed from its inputs.
    MaterializedView,
    /// Stored, fed incrementally from a stream.
    StreamingTable,
}

/// How a stage brings its output up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Recompute everything.
    Full,
    /// Process only what arrived since the last run.
    Incremental,
}

/// One declared stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    /// Stage name; for stored stages, the qualified table name.
    pub name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Refresh mode.
    pub refresh: RefreshMode,
    /// Names of the stages this one reads.
    pub inputs: Vec<String>,
}

impl StageDescriptor {
    fn new(name: &str, kind: StageKind, refresh: RefreshMode, inputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            refresh,
            inputs: inputs.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Display for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.kind, self.refresh)
    }
}

/// The Gold layer stage declarations.
#[must_use]
pub fn gold_stages() -> Vec<StageDescriptor> {
    use RefreshMode::{Full, Incremental};
    use StageKind::{MaterializedView, Source, StreamingTable, View};
    vec![
        StageDescriptor::new(CURATED_CLAIMS, Source, Full, &[]),
        StageDescriptor::new(PAYMENT_EVENTS, Source, Incremental, &[]),
        StageDescriptor::new(FACT_CLAIM, MaterializedView, Full, &[CURATED_CLAIMS]),
        StageDescriptor::new(
            DENIAL_EVENTS_ENRICHED,
            View,
            Incremental,
            &[PAYMENT_EVENTS, FACT_CLAIM],
        ),
        StageDescriptor::new(
            FACT_DENIAL_EVENT,
            StreamingTable,
            Incremental,
            &[DENIAL_EVENTS_ENRICHED],
        ),
    ]
}

/// Orders stages so every stage follows its inputs.
///
/// # Errors
///
/// - [`Error::StageNotFound`] if a stage reads an undeclared stage
/// - [`Error::CycleDetected`] if the inputs form a cycle
pub fn plan_stages(stages: &[StageDescriptor]) -> Result<Vec<StageDescriptor>> {
    let mut dag = Dag::new();
    for stage in stages {
        dag.add_node(stage.name.clone());
    }
    for stage in stages {
        for input in &stage.inputs {
            dag.add_edge(input, &stage.name).map_err(|_| Error::StageNotFound {
                stage: stage.name.clone(),
                input: input.clone(),
            })?;
        }
    }

    let mut order = Vec::with_capacity(dag.len());
    for name in dag.toposort()? {
        tracing::trace!(stage = %name, inputs = ?dag.upstream(&name)?, "planned stage");
        if let Some(stage) = stages.iter().find(|s| s.name == name) {
            order.push(stage.clone());
        }
    }
    Ok(order)
}

/// Outcome of one pipeline update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Claim Fact refresh, if it ran.
    pub refresh: Option<RefreshReport>,
    /// Denial event merge, if it ran.
    pub apply_changes: Option<DrainReport>,
}

/// The Gold pipeline: stage plan plus the runners for stored stages.
#[derive(Debug)]
pub struct Pipeline {
    ctx: ExecutionContext,
    stages: Vec<StageDescriptor>,
    materializer: FactClaimMaterializer,
    engine: ApplyChangesEngine,
}

impl Pipeline {
    /// Builds the pipeline and validates its stage graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the stage declarations do not resolve.
    pub fn new(ctx: ExecutionContext, tables: &PipelineTables) -> Result<Self> {
        let stages = plan_stages(&gold_stages())?;
        Ok(Self {
            materializer: FactClaimMaterializer::new(ctx.clone(), tables),
            engine: ApplyChangesEngine::new(ctx.clone(), tables),
            ctx,
            stages,
        })
    }

    /// Stages in execution order.
    #[must_use]
    pub fn plan(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Runs every stored stage once, in plan order.
    ///
    /// # Errors
    ///
    /// Returns the first stage error; stages that completed stay committed.
    pub async fn update(&mut self) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();
        for stage in &self.stages {
            let span = self.ctx.stage_span(&stage.name);
            let outcome = match stage.name.as_str() {
                FACT_CLAIM => self
                    .materializer
                    .refresh()
                    .instrument(span)
                    .await
                    .map(|r| report.refresh = Some(r)),
                FACT_DENIAL_EVENT => self
                    .engine
                    .drain()
                    .instrument(span)
                    .await
                    .map(|r| report.apply_changes = Some(r)),
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                metrics::record_stage_failure(&stage.name, e.is_retryable());
                return Err(e);
            }
        }
        Ok(report)
    }

    /// Refreshes Claim Fact only.
    ///
    /// # Errors
    ///
    /// See [`FactClaimMaterializer::refresh`].
    pub async fn refresh(&self) -> Result<RefreshReport> {
        self.materializer
            .refresh()
            .instrument(self.ctx.stage_span(FACT_CLAIM))
            .await
    }

    /// Drains the event stream into Denial Event only.
    ///
    /// # Errors
    ///
    /// See [`ApplyChangesEngine::drain`].
    pub async fn apply_changes(&mut self) -> Result<DrainReport> {
        let span = self.ctx.stage_span(FACT_DENIAL_EVENT);
        self.engine.drain().instrument(span).await
    }

    /// Runs the materializer and the merge engine on their configured
    /// intervals until `shutdown` resolves.
    ///
    /// Shutdown is observed between runs; a run in progress completes first.
    /// Retryable stage errors are logged and retried on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either interval is zero, otherwise the
    /// first fatal stage error.
    pub async fn run_continuous<F>(self, shutdown: F) -> Result<()>
    where
        F: Future,
    {
        let config = self.ctx.config();
        for (name, period) in [
            ("refresh_interval", config.refresh_interval),
            ("stream_interval", config.stream_interval),
        ] {
            if period.is_zero() {
                return Err(Error::config(format!("{name} must be positive")));
            }
        }

        let Self {
            ctx,
            materializer,
            mut engine,
            ..
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);

        let signal = async move {
            shutdown.await;
            tracing::info!("shutdown requested");
            let _ = stop_tx.send(true);
            Ok::<(), Error>(())
        };

        let refresh_span = ctx.stage_span(FACT_CLAIM);
        let refresh = run_every(
            FACT_CLAIM,
            ctx.config().refresh_interval,
            stop_rx.clone(),
            move || {
                let materializer = materializer.clone();
                async move { materializer.refresh().await.map(|_| ()) }
            },
        )
        .instrument(refresh_span);

        let stream_span = ctx.stage_span(FACT_DENIAL_EVENT);
        let stream = async move {
            let mut stop = stop_rx;
            let mut ticker = interval(ctx.config().stream_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = engine.drain().await {
                    handle_stage_error(FACT_DENIAL_EVENT, e)?;
                }
            }
            Ok::<(), Error>(())
        }
        .instrument(stream_span);

        tokio::try_join!(signal, refresh, stream)?;
        tracing::info!("pipeline stopped");
        Ok(())
    }
}

/// Runs `work` on every tick until the stop flag flips.
async fn run_every<W, Fut>(
    stage: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut work: W,
) -> Result<()>
where
    W: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = work().await {
            handle_stage_error(stage, e)?;
        }
    }
    Ok(())
}

/// Swallows retryable errors with a warning; returns fatal ones.
fn handle_stage_error(stage: &str, error: Error) -> Result<()> {
    let retryable = error.is_retryable();
    metrics::record_stage_failure(stage, retryable);
    if retryable {
        tracing::warn!(stage, error = %error, "stage failed; retrying next interval");
        Ok(())
    } else {
        tracing::error!(stage, error = %error, "stage failed");
        Err(error)
    }
}
