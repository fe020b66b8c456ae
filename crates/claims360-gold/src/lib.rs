//! # claims360-gold
//!
//! Gold layer of the claims360 medallion pipeline.
//!
//! - **Claim Fact** (`gold.fact_claim`): full refresh from
//!   `silver.curated_claims`, one atomic overwrite per run
//! - **Denial events enriched** (view): denial filter, deterministic
//!   `event_key`, payer lookup against the committed Claim Fact snapshot
//! - **Denial Event** (`gold.fact_denial_event`): incremental CDC merge with
//!   last-writer-wins sequencing on the posted timestamp, Type-1 history
//!
//! ## Guarantees
//!
//! - **Exactly-once effect**: the stream position commits with the merged
//!   rows, and replays are resolved by key and sequence
//! - **Atomic batches**: a failed refresh or micro-batch leaves no visible
//!   effect and no position movement
//! - **Deterministic**: the same inputs produce the same keys, rows and plan
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use claims360_core::{MemoryBackend, ScopedStorage};
//! use claims360_gold::{ExecutionContext, Pipeline, PipelineConfig, PipelineTables};
//!
//! # async fn run() -> claims360_gold::Result<()> {
//! let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "claims360_dev")?;
//! let tables = PipelineTables::ensure(&storage).await?;
//! let ctx = ExecutionContext::new(storage, PipelineConfig::default());
//!
//! let mut pipeline = Pipeline::new(ctx, &tables)?;
//! let report = pipeline.update().await?;
//! println!("{report:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub(crate) mod dag;

pub mod apply_changes;
pub mod config;
pub mod context;
pub mod enrichment;
pub mod error;
pub mod event_key;
pub mod materializer;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod tables;
pub mod upsert;

pub use apply_changes::{ApplyChangesEngine, BatchReport, DrainReport};
pub use config::{InvalidEventPolicy, PipelineConfig};
pub use context::ExecutionContext;
pub use error::{Error, Result};
pub use materializer::{FactClaimMaterializer, RefreshReport};
pub use pipeline::{Pipeline, RefreshMode, StageDescriptor, StageKind, UpdateReport};
pub use tables::PipelineTables;
pub use upsert::MergeCounts;
