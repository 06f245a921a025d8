//! cpcache core - cache coordination, mirror selection and downloads

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate provides the building blocks of the caching package
//! proxy: the download registry that enforces at-most-one writer per
//! cache file, the mirror-walking downloader, the growing-file
//! watcher, mirror selection, persistent metadata, configuration and
//! upload authentication. The HTTP surface lives in `cpcache-server`.

pub mod auth;
pub mod cache_key;
pub mod config;
pub mod download;
pub mod mirrors;
pub mod registry;
pub mod storage;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use cache_key::{CacheKey, InvalidCacheKey};
pub use config::{Config, ConfigError};
pub use download::{
    spawn_filewatcher, ActiveDownload, DownloadError, DownloadHandle, Downloader, WatchEvent,
};
pub use mirrors::MirrorSelector;
pub use registry::{spawn_registry, CacheState, DownloadClaim, RegistryError, RegistryHandle};
pub use storage::{CacheLayout, MetadataDb, MetadataDbError};
pub use tracing_setup::{init_tracing, CliLogLevel};

/// Errors that can bubble up from any cpcache subsystem.
#[derive(Debug, thiserror::Error)]
pub enum CpcacheError {
    /// Configuration loading or validation errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metadata persistence errors
    #[error("metadata database error: {0}")]
    MetadataDb(#[from] MetadataDbError),

    /// Download startup errors
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Download registry communication errors
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Standard I/O errors from filesystem operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client construction or transport errors
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Convenience Result type using CpcacheError as the error type
pub type Result<T> = std::result::Result<T, CpcacheError>;
