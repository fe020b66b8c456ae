//! Catalog-scoped storage.
//!
//! Every path a pipeline touches is prefixed with `catalog={catalog}/`, so a
//! dev and a prod catalog can share one backend without seeing each other's
//! tables. The key=value format keeps paths grep-friendly, in the Hive
//! partition style.
//!
//! # Security
//!
//! - All paths are prefixed with the catalog scope
//! - Path traversal attempts (`..`) are rejected
//! - Catalog ids are validated at construction

use bytes::Bytes;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Catalog scoped storage wrapper.
#[derive(Clone)]
pub struct ScopedStorage {
    backend: Arc<dyn StorageBackend>,
    catalog: String,
}

impl std::fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl ScopedStorage {
    /// Creates a new scoped storage wrapper.
    ///
    /// # Errors
    ///
    /// Returns an error if `catalog` is invalid. Catalog ids must be non-empty,
    /// ASCII lowercase alphanumeric (plus `-` and `_`).
    pub fn new(backend: Arc<dyn StorageBackend>, catalog: impl Into<String>) -> Result<Self> {
        let catalog = catalog.into();
        validate_id(&catalog, "catalog")?;
        Ok(Self { backend, catalog })
    }

    /// Returns the catalog id.
    #[must_use]
    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    fn scope_prefix(&self) -> String {
        format!("catalog={}", self.catalog)
    }

    fn scoped_path(&self, path: &str) -> String {
        format!("{}/{}", self.scope_prefix(), path)
    }

    /// Reads data at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path contains traversal sequences or the object is not found.
    pub async fn get_raw(&self, path: &str) -> Result<Bytes> {
        validate_path(path)?;
        self.backend.get(&self.scoped_path(path)).await
    }

    /// Writes data at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path contains traversal sequences or the write fails.
    pub async fn put_raw(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        validate_path(path)?;
        self.backend
            .put(&self.scoped_path(path), data, precondition)
            .await
    }

    /// Deletes data at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path contains traversal sequences.
    pub async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.backend.delete(&self.scoped_path(path)).await
    }

    /// Lists objects at a scope-relative path prefix.
    ///
    /// Returns relative paths (without the scope prefix), sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix contains traversal sequences.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        validate_path(prefix)?;
        let full_prefix = self.scoped_path(prefix);
        let scope_prefix = format!("{}/", self.scope_prefix());

        let metas = self.backend.list(&full_prefix).await?;

        let mut paths: Vec<String> = metas
            .into_iter()
            .filter_map(|m| m.path.strip_prefix(&scope_prefix).map(str::to_string))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Gets metadata at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path contains traversal sequences.
    pub async fn head_raw(&self, path: &str) -> Result<Option<ObjectMeta>> {
        validate_path(path)?;
        self.backend.head(&self.scoped_path(path)).await
    }
}

/// Validates an identifier used as a single path segment.
///
/// # Errors
///
/// Returns [`Error::InvalidId`] when the id is empty or contains characters
/// outside `a-z`, `0-9`, `-`, `_`.
pub fn validate_id(id: &str, field: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{field} cannot be empty"),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(Error::InvalidId {
            message: format!("{field} contains invalid characters (allowed: a-z, 0-9, '-', '_')"),
        });
    }

    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    if path.starts_with('/') || path.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "absolute paths and backslashes not allowed: {path}"
        )));
    }

    if path.contains('\n') || path.contains('\r') || path.contains('\0') {
        return Err(Error::InvalidInput(format!(
            "control characters not allowed in paths: {path}"
        )));
    }

    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(Error::InvalidInput(format!(
            "path traversal not allowed: {path}"
        )));
    }

    Ok(())
}
