//! Ranged mirror downloads feeding the local cache.
//!
//! A download walks the ranked mirror list until one mirror answers,
//! then streams the response body sequentially into the cache file from
//! a spawned task. The caller gets the file's total size and a handle;
//! everyone else reads the growing file through the filewatcher.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::cache_key::CacheKey;
use crate::registry::{DownloadGuard, RegistryHandle};

static NEXT_DOWNLOAD_ID: AtomicU64 = AtomicU64::new(1);

/// Failure to start a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Every mirror that answered said 404.
    #[error("no mirror has {key}")]
    NotFound {
        /// The requested file.
        key: String,
    },
    /// No mirror produced a usable response.
    #[error("all mirrors failed for {key}")]
    AllMirrorsFailed {
        /// The requested file.
        key: String,
    },
    /// The cache file could not be prepared.
    #[error("cannot open cache file {path}: {source}")]
    Io {
        /// The file that was being prepared.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// A download that has started streaming into the cache file.
pub struct ActiveDownload {
    /// Full size the file will reach, computed from the mirror's
    /// response headers.
    pub total_size: u64,
    /// Handle owning the streaming task.
    pub handle: DownloadHandle,
}

/// Owning handle to a streaming download task.
///
/// Dropping the handle aborts the task: the connection that started a
/// download owns the write side of that cache file, and its death must
/// never leave a writer behind. The registry learns of the abort through
/// the task's liveness guard.
#[derive(Debug)]
pub struct DownloadHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl DownloadHandle {
    /// Identifier used by the registry to key teardown.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Aborts the streaming task.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for DownloadHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts downloads from the ranked mirror list. Cheap to clone.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    registry: RegistryHandle,
}

impl Downloader {
    /// Builds a downloader with its own HTTP client.
    ///
    /// The client bounds connection establishment and per-read stalls,
    /// but not the whole transfer: package bodies legitimately take
    /// minutes.
    ///
    /// # Errors
    /// Any error from building the HTTP client.
    pub fn new(registry: RegistryHandle) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cpcache/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, registry })
    }

    /// Tries each mirror in order until one starts streaming `key` into
    /// `path` from `start_offset`.
    ///
    /// An offset of zero truncates the file (the canonical byte stream
    /// starts over); a nonzero offset appends, which is only correct
    /// because cached files are always a prefix of the canonical file.
    ///
    /// # Errors
    /// - [`DownloadError::NotFound`] - every responding mirror said 404
    /// - [`DownloadError::AllMirrorsFailed`] - mirrors exhausted
    /// - [`DownloadError::Io`] - the cache file could not be opened
    pub async fn fetch(
        &self,
        mirror_urls: &[String],
        key: &CacheKey,
        path: &Path,
        start_offset: u64,
    ) -> Result<ActiveDownload, DownloadError> {
        let mut saw_not_found = false;

        for mirror in mirror_urls {
            let url = package_url(mirror, key);
            let mut request = self.client.get(&url);
            if start_offset > 0 {
                request = request.header(RANGE, format!("bytes={start_offset}-"));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%mirror, %error, "mirror request failed");
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                tracing::debug!(%mirror, key = key.as_str(), "mirror has no such file");
                saw_not_found = true;
                continue;
            }
            if !status.is_success() {
                tracing::warn!(%mirror, %status, key = key.as_str(), "mirror refused request");
                continue;
            }

            let Some(total_size) = total_file_size(&response, start_offset) else {
                tracing::warn!(%mirror, key = key.as_str(), "response carried no usable length");
                continue;
            };

            let file = open_cache_file(path, start_offset)
                .await
                .map_err(|source| DownloadError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;

            let id = NEXT_DOWNLOAD_ID.fetch_add(1, Ordering::Relaxed);
            let guard = self.registry.termination_guard(key.clone(), id);
            tracing::info!(
                key = key.as_str(),
                %mirror,
                start_offset,
                total_size,
                "download started"
            );
            let task = tokio::spawn(write_body_to_file(response, file, key.clone(), guard));

            return Ok(ActiveDownload {
                total_size,
                handle: DownloadHandle { id, task },
            });
        }

        if saw_not_found {
            Err(DownloadError::NotFound {
                key: key.as_str().to_string(),
            })
        } else {
            Err(DownloadError::AllMirrorsFailed {
                key: key.as_str().to_string(),
            })
        }
    }
}

fn package_url(mirror: &str, key: &CacheKey) -> String {
    format!("{}/{}", mirror.trim_end_matches('/'), key.as_str())
}

/// The file's full size: the total from `Content-Range` when the mirror
/// sent one, `Content-Length` plus the requested offset otherwise.
fn total_file_size(response: &Response, start_offset: u64) -> Option<u64> {
    if let Some(value) = response.headers().get(CONTENT_RANGE) {
        if let Some(total) = parse_content_range_total(value.to_str().ok()?) {
            return Some(total);
        }
    }
    response
        .content_length()
        .map(|length| length + start_offset)
}

/// Parses the total out of `bytes <start>-<end>/<total>`. Returns `None`
/// for the unknown-length form `bytes */...` or anything malformed.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes ")?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}

async fn open_cache_file(path: &Path, start_offset: u64) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if start_offset == 0 {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
    } else {
        OpenOptions::new().append(true).open(path).await
    }
}

/// Streams the response body into the cache file. Runs as its own task;
/// failures are logged, not propagated: readers notice through the
/// file itself, and the registry through the guard.
async fn write_body_to_file(
    mut response: Response,
    mut file: File,
    key: CacheKey,
    mut guard: DownloadGuard,
) {
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(error) = file.write_all(&chunk).await {
                    tracing::error!(key = key.as_str(), %error, "write to cache file failed");
                    return;
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(key = key.as_str(), %error, "mirror stream ended early");
                return;
            }
        }
    }
    if let Err(error) = file.flush().await {
        tracing::error!(key = key.as_str(), %error, "flush of cache file failed");
        return;
    }
    guard.mark_clean();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parses() {
        assert_eq!(parse_content_range_total("bytes 500-999/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/1"), Some(1));
        assert_eq!(parse_content_range_total("bytes */1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 500-999/*"), None);
        assert_eq!(parse_content_range_total("items 500-999/1000"), None);
        assert_eq!(parse_content_range_total(""), None);
    }

    #[test]
    fn package_url_joins_cleanly() {
        let key = CacheKey::from_request_target("/core/os/x86_64/linux.pkg").unwrap();
        assert_eq!(
            package_url("https://mirror.example/archlinux/", &key),
            "https://mirror.example/archlinux/core/os/x86_64/linux.pkg"
        );
        assert_eq!(
            package_url("https://mirror.example/archlinux", &key),
            "https://mirror.example/archlinux/core/os/x86_64/linux.pkg"
        );
    }
}
