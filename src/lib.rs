//! Resumable, asynchronous tailing of every file matching a glob pattern.
//!
//! A [`PatternWatcher`] periodically expands its pattern, follows each
//! matching file from its saved offset (or from the start or end, per
//! [`Whence`]) and merges their lines into one stream. Files that have gone
//! quiet for longer than the expire duration are released, and progress is
//! persisted through an [`OffsetStore`] so a later watch picks up where the
//! last one stopped.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use globtail::{JsonFileStore, PatternWatcher, WatchConfig};
//!
//! #[tokio::main]
//! async fn main() -> globtail::Result<()> {
//!     let store = Arc::new(JsonFileStore::open("/var/lib/globtail/app")?);
//!     let mut watcher = PatternWatcher::new(WatchConfig::new("/var/log/app/*.log"), store)?;
//!
//!     for _ in 0..100 {
//!         // `None` means nothing arrived within a second
//!         if let Some(line) = watcher.read_line().await? {
//!             println!("source: {}, line: {}", line.source().display(), line.line());
//!         }
//!     }
//!
//!     watcher.close().await
//! }
//! ```
//!
//! ## Caveats
//!
//! Files are polled, not watched through filesystem events: new files show up
//! on the next stat interval and appended data within a few seconds.
//! Progress is saved by [`PatternWatcher::sync_meta`] and on close only, so a
//! crash in between replays lines read after the last sync.

mod config;
mod discovery;
mod error;
mod source;
mod store;
mod tailer;
mod watcher;

pub use config::{RawWatchConfig, WatchConfig, Whence};
pub use discovery::{glob_matches, is_stale, real_path};
pub use error::{Error, Result};
pub use source::{FileLineSource, LineSource, ReadLine};
pub use store::{JsonFileStore, MemoryStore, OffsetStore};
pub use tailer::{Channels, Delivery, FileTailer, Line, StatusCell, TailStatus};
pub use watcher::{LagInfo, PatternWatcher, WatchStats};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
