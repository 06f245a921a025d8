//! Handle for communicating with the download registry actor.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use super::commands::{CacheState, RegistryCommand, TerminationNotice};
use crate::cache_key::CacheKey;

/// How long a client waits for a registry reply before giving up.
///
/// The registry can be held up by another client's unresolved claim;
/// the bound turns that into a hard, visible failure instead of an
/// unbounded stall.
pub const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Failure to communicate with the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry actor is no longer running.
    #[error("download registry is no longer running")]
    Closed,
    /// The registry did not reply within [`QUERY_TIMEOUT`].
    #[error("download registry did not reply in time")]
    Timeout,
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    notices: mpsc::UnboundedSender<TerminationNotice>,
}

impl RegistryHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<RegistryCommand>,
        notices: mpsc::UnboundedSender<TerminationNotice>,
    ) -> Self {
        Self { commands, notices }
    }

    /// Asks whether `key` is currently being downloaded.
    ///
    /// # Errors
    /// [`RegistryError::Timeout`] when no reply arrives within
    /// [`QUERY_TIMEOUT`], [`RegistryError::Closed`] when the actor is
    /// gone.
    pub async fn query(&self, key: CacheKey) -> Result<CacheState, RegistryError> {
        let (responder, reply) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(RegistryCommand::Query { key, responder })
                .await
                .map_err(|_| RegistryError::Closed)?;
            reply.await.map_err(|_| RegistryError::Closed)
        };
        match time::timeout(QUERY_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout),
        }
    }

    /// Tells the registry that the file for `key` reached its full size.
    /// Teardown is keyed on `download_id`: a notice for a download that
    /// no longer owns the entry is ignored.
    pub async fn download_ended(&self, key: CacheKey, download_id: u64) {
        let _ = self
            .commands
            .send(RegistryCommand::DownloadEnded { key, download_id })
            .await;
    }

    /// Creates the liveness guard a download task must carry. Dropping
    /// the guard (on completion, failure, abort or panic) notifies the
    /// registry that this download is gone.
    pub(crate) fn termination_guard(&self, key: CacheKey, download_id: u64) -> DownloadGuard {
        DownloadGuard {
            key,
            download_id,
            clean: false,
            notices: self.notices.clone(),
        }
    }
}

/// Liveness guard carried by a download task.
///
/// The registry learns of the task's termination through this guard's
/// `Drop`, which runs no matter how the task ends. A task that finished
/// its file calls [`mark_clean`](Self::mark_clean) first so the registry
/// can tell completion from a crash.
pub struct DownloadGuard {
    key: CacheKey,
    download_id: u64,
    clean: bool,
    notices: mpsc::UnboundedSender<TerminationNotice>,
}

impl DownloadGuard {
    /// Marks the download as having ended cleanly.
    pub fn mark_clean(&mut self) {
        self.clean = true;
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        let _ = self.notices.send(TerminationNotice {
            download_id: self.download_id,
            key: self.key.clone(),
            clean: self.clean,
        });
    }
}
