//! # claims360-core
//!
//! Shared primitives for the claims360 Gold pipeline.
//!
//! - **Storage contract**: conditional-write object storage ([`StorageBackend`])
//!   with an in-memory backend for tests and a local filesystem backend
//! - **Scoped storage**: catalog-prefixed paths with traversal protection
//! - **Identifiers**: ULID-backed commit and run ids
//! - **Errors**: the shared [`Error`] type
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use claims360_core::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let storage = ScopedStorage::new(backend, "claims360_dev")?;
//! let paths = TablePaths::new("gold", "fact_claim")?;
//! assert_eq!(paths.metadata(), "tables/gold/fact_claim/_metadata.json");
//! # let _ = storage;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod error;
pub mod id;
pub mod local_fs;
pub mod observability;
pub mod scoped_storage;
pub mod storage;
pub mod table_paths;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CommitId, RunId};
    pub use crate::local_fs::LocalFsBackend;
    pub use crate::scoped_storage::ScopedStorage;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
    pub use crate::table_paths::TablePaths;
}

pub use error::{Error, Result};
pub use id::{CommitId, RunId};
pub use local_fs::LocalFsBackend;
pub use observability::{LogFormat, init_logging};
pub use scoped_storage::ScopedStorage;
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
pub use table_paths::TablePaths;
