//! Polling observer of a growing cache file.
//!
//! One watcher per tailing client. Filesystem change notification is
//! deliberately not used: a 100 ms poll is plenty for package downloads
//! and behaves identically everywhere.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// How often the watched file is stat'ed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the file may sit unchanged before the watcher declares the
/// writer dead.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// What the watcher observed about the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The file grew; bytes `[previous, current)` are newly readable.
    SizeIncreased {
        /// Size at the previous observation.
        previous: u64,
        /// Size now.
        current: u64,
    },
    /// The file reached its expected size. Terminal. Consumers that
    /// already observed completion another way ignore this.
    Complete {
        /// Size at the previous observation.
        previous: u64,
        /// Final size (clamped to the expected size).
        current: u64,
    },
    /// The file stopped growing for longer than the stall timeout.
    /// Terminal; the writer is presumed dead.
    Stalled {
        /// Size at which growth stopped.
        size: u64,
    },
}

/// Spawns a watcher that reports growth of `path` until it reaches
/// `expected_size`, stalls, or the receiver is dropped.
///
/// The events channel is bounded, so a consumer busy writing to a slow
/// client socket backpressures the watcher naturally.
pub fn spawn_filewatcher(
    path: PathBuf,
    expected_size: u64,
    start_size: u64,
    stall_timeout: Duration,
    events: mpsc::Sender<WatchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut previous = start_size;
        let mut last_growth = Instant::now();

        loop {
            interval.tick().await;

            let current = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                // The file may not exist yet right after a download
                // started; treat as no growth.
                Err(_) => previous,
            };

            if current >= expected_size {
                let _ = events
                    .send(WatchEvent::Complete {
                        previous,
                        current: expected_size,
                    })
                    .await;
                return;
            }

            if current > previous {
                if events
                    .send(WatchEvent::SizeIncreased { previous, current })
                    .await
                    .is_err()
                {
                    return; // consumer gone
                }
                previous = current;
                last_growth = Instant::now();
            } else if last_growth.elapsed() >= stall_timeout {
                let _ = events.send(WatchEvent::Stalled { size: current }).await;
                return;
            }
        }
    })
}
