//! On-disk layout of the cache and the persistent metadata database.

pub mod metadata;

pub use metadata::{MetadataDb, MetadataDbError};

use std::io;
use std::path::{Path, PathBuf};

use crate::cache_key::CacheKey;

/// Resolves where cached packages and the metadata database live under
/// the configured cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Creates a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding cached package files.
    pub fn package_root(&self) -> PathBuf {
        self.root.join("pkg")
    }

    /// On-disk location of the cached file for `key`.
    pub fn package_path(&self, key: &CacheKey) -> PathBuf {
        self.package_root().join(key.as_str())
    }

    /// Location of the metadata database file.
    pub fn metadata_db_path(&self) -> PathBuf {
        self.root.join("cpcache.db")
    }

    /// Creates the cache directories if they do not exist yet.
    ///
    /// # Errors
    /// Any error from `create_dir_all`.
    pub async fn ensure_directories(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.package_root()).await
    }
}
