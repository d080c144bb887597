//! Blob store access for hosted landing pages.
//!
//! Two namespaces exist: the global assets namespace keyed by plain
//! path, and the per-user drive namespace keyed by
//! `{userId}/DRIVE_{driveName}/{path}`. Both go through the same
//! interface; the dispatcher composes the drive key itself.

use crate::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    pub bytes: Bytes,
    /// Stored metadata override; when absent the content type is
    /// derived from the file extension.
    pub content_type: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Blob>>;
}

/// Filesystem-backed blob store rooted at a directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsBlobStore { root: root.into() }
    }

    /// Maps a blob key to a path under the root, rejecting traversal.
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        let Some(path) = self.resolve(key) else {
            return Ok(None);
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Blob {
                bytes: Bytes::from(bytes),
                content_type: None,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            // Directories land here on some platforms; treat as a miss.
            Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory blob store used by tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>) {
        self.insert_typed(key, bytes, None);
    }

    pub fn insert_typed(&self, key: &str, bytes: impl Into<Bytes>, content_type: Option<&str>) {
        self.entries.write().insert(
            key.trim_start_matches('/').to_string(),
            Blob {
                bytes: bytes.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        Ok(self
            .entries
            .read()
            .get(key.trim_start_matches('/'))
            .cloned())
    }
}
