//! Serve strategies for package GET requests.
//!
//! A request for a package lands in one of three worlds: the file is
//! complete on disk, it is partially on disk, or it is absent. The
//! partial and absent cases consult the download registry: when a
//! download is already in flight the client tails the growing file,
//! otherwise the client claims the key and starts the download itself,
//! splicing whatever is already cached with the mirror's bytes into one
//! response.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use cpcache_core::download::{spawn_filewatcher, WatchEvent, DEFAULT_STALL_TIMEOUT};
use cpcache_core::registry::DownloadClaim;
use cpcache_core::{CacheKey, CacheState, DownloadError, MetadataDb};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::connection::{Connection, RequestError};
use crate::http::Status;

/// What the cache knows about a requested file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileClass {
    /// On disk and at its full recorded size.
    Complete { total_size: u64 },
    /// On disk with a correct prefix, still short of the recorded size.
    Partial { local_size: u64, total_size: u64 },
    /// Not on disk, empty on disk, or of unknown total size. A partial
    /// file without a recorded length is unusable: serving it would
    /// risk handing out a stale prefix.
    NotFound,
}

pub(crate) async fn classify(
    db: &MetadataDb,
    path: &Path,
    key: &CacheKey,
) -> Result<FileClass, RequestError> {
    let local_size = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => 0,
    };
    if local_size == 0 {
        return Ok(FileClass::NotFound);
    }
    let Some(total_size) = db.content_length(key.basename()).await? else {
        return Ok(FileClass::NotFound);
    };
    match local_size.cmp(&total_size) {
        std::cmp::Ordering::Equal => Ok(FileClass::Complete { total_size }),
        std::cmp::Ordering::Less => Ok(FileClass::Partial {
            local_size,
            total_size,
        }),
        std::cmp::Ordering::Greater => Err(RequestError::Internal(format!(
            "cached file {} exceeds its recorded length",
            path.display()
        ))),
    }
}

impl Connection {
    /// Entry point for a package GET once special paths and database
    /// redirects are out of the way.
    pub(crate) async fn serve_package(
        &mut self,
        key: CacheKey,
        range_start: Option<u64>,
    ) -> Result<(), RequestError> {
        let path = self.app.layout.package_path(&key);
        match classify(&self.app.db, &path, &key).await? {
            FileClass::Complete { total_size } => {
                self.serve_complete(&path, total_size, range_start).await
            }
            FileClass::Partial { local_size, .. } => {
                self.serve_partial(key, path, local_size, range_start).await
            }
            FileClass::NotFound => self.serve_missing(key, path, range_start).await,
        }
    }

    /// Serves a file that is fully cached, from `range_start` onward.
    async fn serve_complete(
        &mut self,
        path: &Path,
        total_size: u64,
        range_start: Option<u64>,
    ) -> Result<(), RequestError> {
        let start = range_start.unwrap_or(0);
        if start > total_size {
            return self
                .send_text(Status::RangeNotSatisfiable, "range not satisfiable\n")
                .await;
        }

        self.send_package_head(total_size, range_start).await?;
        if start == total_size {
            return Ok(()); // the client already has everything
        }

        let mut file = File::open(path)
            .await
            .map_err(|source| RequestError::CacheFile {
                path: path.to_path_buf(),
                source,
            })?;
        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|source| RequestError::CacheFile {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        self.copy_from_file(&mut file, total_size - start).await
    }

    /// A partial file: tail the in-flight download when there is one,
    /// otherwise splice cache and mirror ourselves.
    async fn serve_partial(
        &mut self,
        key: CacheKey,
        path: PathBuf,
        local_size: u64,
        range_start: Option<u64>,
    ) -> Result<(), RequestError> {
        match self.app.registry.query(key.clone()).await? {
            CacheState::Downloading {
                total_size,
                download_id,
            } => {
                self.tail_growing_file(key, path, total_size, download_id, range_start)
                    .await
            }
            CacheState::Unknown(claim) => {
                self.splice_cache_and_mirror(claim, key, path, local_size, range_start)
                    .await
            }
        }
    }

    /// Nothing usable on disk. A ranged request is redirected (a cache
    /// file must begin at byte zero of the canonical stream, so we
    /// cannot start caching mid-file); otherwise we either tail an
    /// in-flight download or start one from scratch.
    async fn serve_missing(
        &mut self,
        key: CacheKey,
        path: PathBuf,
        range_start: Option<u64>,
    ) -> Result<(), RequestError> {
        if range_start.is_some() {
            return self.redirect_to_mirror(&key).await;
        }
        match self.app.registry.query(key.clone()).await? {
            CacheState::Downloading {
                total_size,
                download_id,
            } => {
                self.tail_growing_file(key, path, total_size, download_id, None)
                    .await
            }
            CacheState::Unknown(claim) => self.download_fresh(claim, key, path).await,
        }
    }

    /// Streams a file some other connection is currently downloading.
    async fn tail_growing_file(
        &mut self,
        key: CacheKey,
        path: PathBuf,
        total_size: u64,
        download_id: u64,
        range_start: Option<u64>,
    ) -> Result<(), RequestError> {
        let start = range_start.unwrap_or(0);
        if start > total_size {
            return self
                .send_text(Status::RangeNotSatisfiable, "range not satisfiable\n")
                .await;
        }
        tracing::debug!(key = key.as_str(), "tailing in-progress download");
        self.send_package_head(total_size, range_start).await?;
        if start == total_size {
            return Ok(());
        }
        self.stream_tail(key, path, total_size, download_id, start)
            .await
    }

    /// Holds the claim for a file with a cached prefix: serve the
    /// prefix from disk and the rest from a mirror, as one response.
    async fn splice_cache_and_mirror(
        &mut self,
        claim: DownloadClaim,
        key: CacheKey,
        path: PathBuf,
        local_size: u64,
        range_start: Option<u64>,
    ) -> Result<(), RequestError> {
        // The download that produced this partial file may have finished
        // between classification and claiming; re-check before splicing.
        let local_size = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => local_size,
        };
        let recorded_total = self.app.db.content_length(key.basename()).await?;
        if recorded_total == Some(local_size) {
            claim.already_complete();
            return self.serve_complete(&path, local_size, range_start).await;
        }

        if let Some(start) = range_start {
            if recorded_total.is_some_and(|total| start == total) {
                claim.already_complete();
                return self.send_package_head(start, range_start).await;
            }
            if recorded_total.is_some_and(|total| start > total) {
                drop(claim);
                return self
                    .send_text(Status::RangeNotSatisfiable, "range not satisfiable\n")
                    .await;
            }
            if start > local_size {
                // Bytes past the cached prefix have not been observed
                // from the start of the canonical stream.
                drop(claim);
                return self
                    .send_text(Status::NotImplemented, "range starts beyond cached bytes\n")
                    .await;
            }
        }
        let start = range_start.unwrap_or(0);

        let mirrors = self.app.mirrors.get_all();
        match self
            .app
            .downloader
            .fetch(&mirrors, &key, &path, local_size)
            .await
        {
            Ok(active) => {
                let total_size = active.total_size;
                let download_id = active.handle.id();
                if claim.register(total_size, download_id).is_err() {
                    return Err(RequestError::Internal(
                        "download registration raced the registry deadline".to_string(),
                    ));
                }
                self.download = Some(active.handle);
                self.send_package_head(total_size, range_start).await?;
                self.stream_tail(key, path, total_size, download_id, start)
                    .await
            }
            Err(DownloadError::NotFound { .. }) => {
                claim.not_found();
                self.send_text(Status::NotFound, "not found\n").await
            }
            Err(error) => {
                tracing::warn!(key = key.as_str(), %error, "resuming download failed");
                drop(claim);
                self.send_text(Status::InternalServerError, "internal server error\n")
                    .await
            }
        }
    }

    /// Holds the claim for a file with nothing on disk: start the
    /// download, record its length, register it and stream from zero.
    async fn download_fresh(
        &mut self,
        claim: DownloadClaim,
        key: CacheKey,
        path: PathBuf,
    ) -> Result<(), RequestError> {
        let mirrors = self.app.mirrors.get_all();
        match self.app.downloader.fetch(&mirrors, &key, &path, 0).await {
            Ok(active) => {
                let total_size = active.total_size;
                if let Err(error) = self
                    .app
                    .db
                    .record_content_length(key.basename(), total_size)
                    .await
                {
                    tracing::warn!(key = key.as_str(), %error, "failed to persist content length");
                }
                let download_id = active.handle.id();
                if claim.register(total_size, download_id).is_err() {
                    // Never recorded, so it must not keep writing either;
                    // dropping `active` aborts the transfer.
                    return Err(RequestError::Internal(
                        "download registration raced the registry deadline".to_string(),
                    ));
                }
                self.download = Some(active.handle);
                self.send_package_head(total_size, None).await?;
                self.stream_tail(key, path, total_size, download_id, 0).await
            }
            Err(DownloadError::NotFound { .. }) => {
                claim.not_found();
                remove_empty_placeholder(&path).await;
                self.send_text(Status::NotFound, "not found\n").await
            }
            Err(error) => {
                tracing::warn!(key = key.as_str(), %error, "download could not start");
                drop(claim);
                self.send_text(Status::InternalServerError, "internal server error\n")
                    .await
            }
        }
    }

    /// Writes the package response head: always `200 OK`, with a
    /// `Content-Range` when the client sent a range. Flushed so tailing
    /// clients see headers before the body trickles in.
    async fn send_package_head(
        &mut self,
        total_size: u64,
        range_start: Option<u64>,
    ) -> Result<(), RequestError> {
        let start = range_start.unwrap_or(0);
        let mut head = crate::http::ResponseHead::new(Status::Ok)
            .header("Content-Type", "application/octet-stream")
            .content_length(total_size - start);
        if range_start.is_some() {
            head = head.header(
                "Content-Range",
                format!(
                    "bytes {}-{}/{}",
                    start,
                    total_size.saturating_sub(1),
                    total_size
                ),
            );
        }
        self.write_head(&head).await?;
        self.io
            .flush()
            .await
            .map_err(|_| RequestError::ClientDisconnected)
    }

    /// Sends `[start_at, total_size)` of a file that is still being
    /// written: whatever is on disk immediately, the rest as the
    /// filewatcher reports growth. On completion the registry is told
    /// the download ended.
    async fn stream_tail(
        &mut self,
        key: CacheKey,
        path: PathBuf,
        total_size: u64,
        download_id: u64,
        start_at: u64,
    ) -> Result<(), RequestError> {
        let mut file = File::open(&path)
            .await
            .map_err(|source| RequestError::CacheFile {
                path: path.clone(),
                source,
            })?;
        let mut sent = start_at;
        if sent > 0 {
            file.seek(SeekFrom::Start(sent))
                .await
                .map_err(|source| RequestError::CacheFile {
                    path: path.clone(),
                    source,
                })?;
        }

        let on_disk = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        let available = on_disk.min(total_size);
        if available > sent {
            self.copy_from_file(&mut file, available - sent).await?;
            sent = available;
        }
        if sent >= total_size {
            self.app.registry.download_ended(key, download_id).await;
            return Ok(());
        }

        let (events_tx, mut events) = mpsc::channel(8);
        let _watcher = spawn_filewatcher(
            path.clone(),
            total_size,
            available,
            DEFAULT_STALL_TIMEOUT,
            events_tx,
        );

        while let Some(event) = events.recv().await {
            match event {
                WatchEvent::SizeIncreased { current, .. } => {
                    let target = current.min(total_size);
                    if target > sent {
                        self.copy_from_file(&mut file, target - sent).await?;
                        sent = target;
                    }
                }
                WatchEvent::Complete { .. } => {
                    if total_size > sent {
                        self.copy_from_file(&mut file, total_size - sent).await?;
                    }
                    self.app.registry.download_ended(key, download_id).await;
                    return Ok(());
                }
                WatchEvent::Stalled { size } => {
                    tracing::warn!(
                        key = key.as_str(),
                        size,
                        "writer stalled; truncating response"
                    );
                    return Err(RequestError::Truncated);
                }
            }
        }
        Err(RequestError::Truncated)
    }

    /// Copies exactly `length` bytes from the file's current position to
    /// the client. The bytes are known to be on disk, so anything short
    /// is an internal error rather than an EOF.
    async fn copy_from_file(&mut self, file: &mut File, length: u64) -> Result<(), RequestError> {
        let mut window = file.take(length);
        let copied = tokio::io::copy(&mut window, &mut self.io)
            .await
            .map_err(|_| RequestError::ClientDisconnected)?;
        if copied != length {
            return Err(RequestError::Internal(format!(
                "cache file ended early: wanted {length} bytes, copied {copied}"
            )));
        }
        self.io
            .flush()
            .await
            .map_err(|_| RequestError::ClientDisconnected)
    }
}

async fn remove_empty_placeholder(path: &Path) {
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        if metadata.len() == 0 {
            if let Err(error) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), %error, "could not remove placeholder");
            }
        }
    }
}
