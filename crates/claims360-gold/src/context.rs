//! Execution context passed to every stage.

use claims360_core::observability::pipeline_span;
use claims360_core::{RunId, ScopedStorage};
use tracing::Span;

use crate::config::PipelineConfig;

/// Storage, configuration and run identity for one pipeline process.
///
/// Stages receive the context explicitly; nothing is read from globals.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    storage: ScopedStorage,
    config: PipelineConfig,
    run_id: RunId,
}

impl ExecutionContext {
    /// Creates a context for a new run.
    #[must_use]
    pub fn new(storage: ScopedStorage, config: PipelineConfig) -> Self {
        Self {
            storage,
            config,
            run_id: RunId::generate(),
        }
    }

    /// Pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run id shared by every stage of this process.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Span for one stage invocation.
    #[must_use]
    pub fn stage_span(&self, stage: &str) -> Span {
        pipeline_span(stage, &self.run_id.to_string(), self.storage.catalog())
    }
}
