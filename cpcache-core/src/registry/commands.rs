//! Command and reply types for the download registry actor.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::cache_key::CacheKey;

/// Commands accepted by the registry actor.
pub(crate) enum RegistryCommand {
    /// Ask whether `key` is currently being downloaded.
    Query {
        key: CacheKey,
        responder: oneshot::Sender<CacheState>,
    },
    /// A tailing client observed the file reach its full size.
    DownloadEnded { key: CacheKey, download_id: u64 },
}

/// Reply to a registry query.
pub enum CacheState {
    /// A downloader is currently writing this file; tail it.
    Downloading {
        /// Full size the file will reach.
        total_size: u64,
        /// Id of the writing download, for keyed teardown.
        download_id: u64,
    },
    /// Nobody is downloading this file. The caller now holds the
    /// exclusive right to start a download for it and must resolve the
    /// claim promptly; the registry serves no other command until it
    /// does.
    Unknown(DownloadClaim),
}

/// Resolution of a [`DownloadClaim`], sent back to the waiting actor.
pub(crate) enum ClaimUpdate {
    Registered { total_size: u64, download_id: u64 },
    NotFound,
    AlreadyComplete,
    Abandoned,
}

/// The registry stopped waiting for this claim before it was resolved.
#[derive(Debug, Error)]
#[error("the registry stopped waiting for this download claim")]
pub struct ClaimLost;

/// Exclusive right to start the download for one cache key.
///
/// Handed out in [`CacheState::Unknown`]. The holder must either
/// [`register`](Self::register) a started download, report the file as
/// [`not_found`](Self::not_found) upstream, or report it
/// [`already_complete`](Self::already_complete). Dropping the claim
/// unresolved releases the key and is logged as a protocol violation.
pub struct DownloadClaim {
    key: CacheKey,
    update: Option<oneshot::Sender<ClaimUpdate>>,
}

impl DownloadClaim {
    pub(crate) fn new(key: CacheKey, update: oneshot::Sender<ClaimUpdate>) -> Self {
        Self {
            key,
            update: Some(update),
        }
    }

    /// The key this claim covers.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Registers a started download, making subsequent queries for this
    /// key return [`CacheState::Downloading`].
    ///
    /// # Errors
    /// [`ClaimLost`] when the registry already gave up waiting; the
    /// caller must then abort the download it started, since it was
    /// never recorded.
    pub fn register(mut self, total_size: u64, download_id: u64) -> Result<(), ClaimLost> {
        self.resolve(ClaimUpdate::Registered {
            total_size,
            download_id,
        })
    }

    /// Reports that no mirror has this file; the registry state is
    /// unchanged.
    pub fn not_found(mut self) {
        let _ = self.resolve(ClaimUpdate::NotFound);
    }

    /// Reports that the local file turned out to be complete; the
    /// registry state is unchanged.
    pub fn already_complete(mut self) {
        let _ = self.resolve(ClaimUpdate::AlreadyComplete);
    }

    fn resolve(&mut self, update: ClaimUpdate) -> Result<(), ClaimLost> {
        self.update
            .take()
            .ok_or(ClaimLost)?
            .send(update)
            .map_err(|_| ClaimLost)
    }
}

impl Drop for DownloadClaim {
    fn drop(&mut self) {
        if let Some(update) = self.update.take() {
            let _ = update.send(ClaimUpdate::Abandoned);
        }
    }
}

/// Sent to the registry when a download task ends, however it ends.
pub(crate) struct TerminationNotice {
    pub(crate) download_id: u64,
    pub(crate) key: CacheKey,
    pub(crate) clean: bool,
}
