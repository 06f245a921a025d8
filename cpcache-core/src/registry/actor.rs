//! Actor implementation for the download registry.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time;

use super::commands::{
    CacheState, ClaimUpdate, DownloadClaim, RegistryCommand, TerminationNotice,
};
use super::handle::RegistryHandle;
use crate::cache_key::CacheKey;

/// How long the registry waits for a claim follow-up before releasing
/// the key. Exceeding it means a client broke the claim protocol.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

struct DownloadEntry {
    total_size: u64,
    download_id: u64,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<CacheKey, DownloadEntry>,
    key_by_download: HashMap<u64, CacheKey>,
}

impl RegistryState {
    fn insert(&mut self, key: CacheKey, total_size: u64, download_id: u64) {
        self.key_by_download.insert(download_id, key.clone());
        self.entries.insert(
            key,
            DownloadEntry {
                total_size,
                download_id,
            },
        );
    }

    fn download_ended(&mut self, key: &CacheKey, download_id: u64) {
        let owns_entry = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.download_id == download_id);
        if owns_entry {
            self.entries.remove(key);
            self.key_by_download.remove(&download_id);
            tracing::debug!(key = key.as_str(), download_id, "download ended");
        } else {
            tracing::debug!(
                key = key.as_str(),
                download_id,
                "stale download_ended ignored"
            );
        }
    }

    fn download_terminated(&mut self, notice: TerminationNotice) {
        match self.key_by_download.remove(&notice.download_id) {
            Some(key) => {
                self.entries.remove(&key);
                if notice.clean {
                    tracing::debug!(key = key.as_str(), "download task finished");
                } else {
                    tracing::warn!(
                        key = key.as_str(),
                        download_id = notice.download_id,
                        "download task terminated uncleanly; key released"
                    );
                }
            }
            None => tracing::debug!(
                download_id = notice.download_id,
                "termination notice for unregistered download"
            ),
        }
    }
}

/// Spawns the registry actor and returns its handle.
///
/// The actor processes commands one at a time, which is what makes the
/// claim protocol race-free: between handing out a claim and receiving
/// its resolution, no other client can be told anything about any file.
pub fn spawn_registry() -> RegistryHandle {
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (notices_tx, notices_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_registry_loop(commands_rx, notices_rx));

    RegistryHandle::new(commands_tx, notices_tx)
}

async fn run_registry_loop(
    mut commands: mpsc::Receiver<RegistryCommand>,
    mut notices: mpsc::UnboundedReceiver<TerminationNotice>,
) {
    tracing::debug!("download registry started");
    let mut state = RegistryState::default();

    loop {
        tokio::select! {
            Some(command) = commands.recv() => handle_command(&mut state, command).await,
            Some(notice) = notices.recv() => state.download_terminated(notice),
            else => break,
        }
    }

    tracing::debug!("download registry stopped");
}

async fn handle_command(state: &mut RegistryState, command: RegistryCommand) {
    match command {
        RegistryCommand::Query { key, responder } => {
            if let Some(entry) = state.entries.get(&key) {
                let _ = responder.send(CacheState::Downloading {
                    total_size: entry.total_size,
                    download_id: entry.download_id,
                });
                return;
            }
            let (update_tx, update_rx) = oneshot::channel();
            let claim = DownloadClaim::new(key.clone(), update_tx);
            if responder.send(CacheState::Unknown(claim)).is_err() {
                // Caller is gone; the claim was dropped with the reply.
                return;
            }
            wait_for_claim(state, key, update_rx).await;
        }
        RegistryCommand::DownloadEnded { key, download_id } => {
            state.download_ended(&key, download_id);
        }
    }
}

/// Blocks the actor until the claim handed out for `key` is resolved.
/// All other commands queue behind this wait, so nobody can observe the
/// key in a half-claimed state.
async fn wait_for_claim(
    state: &mut RegistryState,
    key: CacheKey,
    update: oneshot::Receiver<ClaimUpdate>,
) {
    match time::timeout(CLAIM_TIMEOUT, update).await {
        Ok(Ok(ClaimUpdate::Registered {
            total_size,
            download_id,
        })) => {
            tracing::debug!(
                key = key.as_str(),
                total_size,
                download_id,
                "download registered"
            );
            state.insert(key, total_size, download_id);
        }
        Ok(Ok(ClaimUpdate::NotFound)) | Ok(Ok(ClaimUpdate::AlreadyComplete)) => {}
        Ok(Ok(ClaimUpdate::Abandoned)) | Ok(Err(_)) => {
            tracing::warn!(
                key = key.as_str(),
                "download claim released without resolution"
            );
        }
        Err(_) => {
            tracing::error!(
                key = key.as_str(),
                "no claim follow-up within {CLAIM_TIMEOUT:?}; releasing key"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::from_request_target(s).unwrap()
    }

    #[tokio::test]
    async fn query_unknown_then_register() {
        let registry = spawn_registry();

        let state = registry.query(key("/a.pkg")).await.unwrap();
        let CacheState::Unknown(claim) = state else {
            panic!("expected unknown");
        };
        claim.register(1000, 7).unwrap();

        match registry.query(key("/a.pkg")).await.unwrap() {
            CacheState::Downloading {
                total_size,
                download_id,
            } => {
                assert_eq!(total_size, 1000);
                assert_eq!(download_id, 7);
            }
            CacheState::Unknown(_) => panic!("expected downloading"),
        }
    }

    #[tokio::test]
    async fn dropped_claim_releases_key() {
        let registry = spawn_registry();

        let CacheState::Unknown(claim) = registry.query(key("/a.pkg")).await.unwrap() else {
            panic!("expected unknown");
        };
        drop(claim);

        // The key must be claimable again.
        let CacheState::Unknown(claim) = registry.query(key("/a.pkg")).await.unwrap() else {
            panic!("expected unknown after abandoned claim");
        };
        claim.not_found();
    }

    #[tokio::test]
    async fn not_found_leaves_state_unchanged() {
        let registry = spawn_registry();

        let CacheState::Unknown(claim) = registry.query(key("/a.pkg")).await.unwrap() else {
            panic!("expected unknown");
        };
        claim.not_found();

        assert!(matches!(
            registry.query(key("/a.pkg")).await.unwrap(),
            CacheState::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn download_ended_requires_matching_id() {
        let registry = spawn_registry();

        let CacheState::Unknown(claim) = registry.query(key("/a.pkg")).await.unwrap() else {
            panic!("expected unknown");
        };
        claim.register(1000, 7).unwrap();

        // Wrong id: entry stays.
        registry.download_ended(key("/a.pkg"), 8).await;
        assert!(matches!(
            registry.query(key("/a.pkg")).await.unwrap(),
            CacheState::Downloading { .. }
        ));

        // Matching id: entry removed.
        registry.download_ended(key("/a.pkg"), 7).await;
        assert!(matches!(
            registry.query(key("/a.pkg")).await.unwrap(),
            CacheState::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn dropped_guard_releases_entry() {
        let registry = spawn_registry();

        let CacheState::Unknown(claim) = registry.query(key("/a.pkg")).await.unwrap() else {
            panic!("expected unknown");
        };
        let guard = registry.termination_guard(key("/a.pkg"), 7);
        claim.register(1000, 7).unwrap();

        drop(guard); // downloader died without completing

        // Give the actor a moment to process the notice.
        time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            registry.query(key("/a.pkg")).await.unwrap(),
            CacheState::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let registry = spawn_registry();

        let CacheState::Unknown(claim) = registry.query(key("/a.pkg")).await.unwrap() else {
            panic!("expected unknown");
        };
        claim.register(1000, 1).unwrap();

        // A different key is still claimable while /a.pkg downloads.
        assert!(matches!(
            registry.query(key("/b.pkg")).await.unwrap(),
            CacheState::Unknown(_)
        ));
        assert!(matches!(
            registry.query(key("/a.pkg")).await.unwrap(),
            CacheState::Downloading { .. }
        ));
    }
}
