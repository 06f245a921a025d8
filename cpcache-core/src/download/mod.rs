//! Fetching packages from mirrors and observing growing cache files.

mod downloader;
mod filewatcher;

pub use downloader::{ActiveDownload, DownloadError, DownloadHandle, Downloader};
pub use filewatcher::{spawn_filewatcher, WatchEvent, DEFAULT_STALL_TIMEOUT, POLL_INTERVAL};
