//! Local filesystem storage backend.
//!
//! Objects are files under a root directory. Writes go to a temporary sibling
//! and are published atomically:
//! - `DoesNotExist` publishes with `hard_link`, which fails if the target
//!   exists. This holds across processes, so commit-log entries stay
//!   put-if-absent even with two pipeline processes on one directory.
//! - `None` publishes with `rename`.
//!
//! The temporary file is synced before it is published and the parent
//! directory after, so a published entry never outlives its content across
//! an OS crash.
//!
//! Version tokens are the first 16 bytes of the SHA-256 of the content, hex
//! encoded.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt as _;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

const TMP_MARKER: &str = ".tmp-";

/// Durable storage backend rooted at a local directory.
#[derive(Debug)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::storage_with_source(format!("failed to create {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == "..") {
            return Err(Error::InvalidInput(format!("invalid object path: {path}")));
        }
        Ok(self.root.join(path))
    }

    async fn read_if_exists(file: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read {}", file.display()),
                e,
            )),
        }
    }

    async fn meta_for(&self, file: &Path, rel: &str) -> Result<Option<ObjectMeta>> {
        let Some(bytes) = Self::read_if_exists(file).await? else {
            return Ok(None);
        };
        let last_modified = tokio::fs::metadata(file)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(Some(ObjectMeta {
            path: rel.to_string(),
            size: bytes.len() as u64,
            version: content_version(&bytes),
            last_modified,
        }))
    }

    async fn write_temp(file: &Path, data: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage_with_source(format!("failed to create {}", parent.display()), e)
            })?;
        }
        let mut tmp = file.as_os_str().to_owned();
        tmp.push(format!("{TMP_MARKER}{}", Ulid::new()));
        let tmp = PathBuf::from(tmp);
        let write_err = |e: std::io::Error| {
            Error::storage_with_source(format!("failed to write {}", tmp.display()), e)
        };
        let mut out = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        out.write_all(data).await.map_err(write_err)?;
        out.sync_all().await.map_err(write_err)?;
        Ok(tmp)
    }

    /// Flushes the directory entry for a freshly published file.
    #[cfg(unix)]
    async fn sync_parent(file: &Path) -> Result<()> {
        let Some(parent) = file.parent() else {
            return Ok(());
        };
        let dir = tokio::fs::File::open(parent).await.map_err(|e| {
            Error::storage_with_source(format!("failed to open {}", parent.display()), e)
        })?;
        dir.sync_all().await.map_err(|e| {
            Error::storage_with_source(format!("failed to sync {}", parent.display()), e)
        })
    }

    // Directories cannot be opened for sync off unix.
    #[cfg(not(unix))]
    #[allow(clippy::unused_async)]
    async fn sync_parent(_file: &Path) -> Result<()> {
        Ok(())
    }
}

/// Computes the version token for an object's content.
#[must_use]
pub fn content_version(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..16])
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let file = self.resolve(path)?;
        Self::read_if_exists(&file)
            .await?
            .map(Bytes::from)
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let file = self.resolve(path)?;
        let new_version = content_version(&data);

        let tmp = Self::write_temp(&file, &data).await?;

        if matches!(precondition, WritePrecondition::DoesNotExist) {
            let linked = tokio::fs::hard_link(&tmp, &file).await;
            let _ = tokio::fs::remove_file(&tmp).await;
            return match linked {
                Ok(()) => {
                    Self::sync_parent(&file).await?;
                    Ok(WriteResult::Success {
                        version: new_version,
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let current = Self::read_if_exists(&file).await?.unwrap_or_default();
                    Ok(WriteResult::PreconditionFailed {
                        current_version: content_version(&current),
                    })
                }
                Err(e) => Err(Error::storage_with_source(
                    format!("failed to publish {}", file.display()),
                    e,
                )),
            };
        }

        tokio::fs::rename(&tmp, &file).await.map_err(|e| {
            Error::storage_with_source(format!("failed to publish {}", file.display()), e)
        })?;
        Self::sync_parent(&file).await?;

        Ok(WriteResult::Success {
            version: new_version,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.resolve(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to delete {}", file.display()),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("failed to list {}", dir.display()),
                        e,
                    ));
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source("failed to read directory entry", e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::storage_with_source("failed to stat entry", e))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }

                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                if rel.contains(TMP_MARKER) || !rel.starts_with(prefix) {
                    continue;
                }
                if let Some(meta) = self.meta_for(&path, &rel).await? {
                    out.push(meta);
                }
            }
        }

        Ok(out)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let file = self.resolve(path)?;
        self.meta_for(&file, path).await
    }
}
