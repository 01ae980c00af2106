//! Following every file matched by a glob pattern.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::Stream as FuturesStream;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::discovery::{glob_matches, is_stale, real_path};
use crate::error::{Error, Result};
use crate::store::OffsetStore;
use crate::tailer::{Channels, Delivery, FileTailer, Line, StatusCell, TailStatus, CLOSE_TIMEOUT};

/// How long [`PatternWatcher::read_line`] waits before giving up.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause on close so handoffs already under way can land before syncing.
const CLOSE_GRACE: Duration = Duration::from_millis(10);

/// Unread bytes across every tracked file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LagInfo {
    pub size: u64,
    pub size_unit: &'static str,
    /// Per-file failures, one per line; `None` if every file reported.
    pub errors: Option<String>,
}

/// Aggregated status of a watch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WatchStats {
    pub last_error: String,
}

enum Admit {
    Added,
    /// Another pass registered the same file meanwhile.
    Duplicate,
    Full,
}

#[derive(Debug, Default)]
struct Tracked {
    tailers: HashMap<PathBuf, Arc<FileTailer>>,
    /// Pending lines saved by the last sync, keyed by identity.
    cache: HashMap<PathBuf, String>,
}

struct Shared {
    config: WatchConfig,
    store: Arc<dyn OffsetStore>,
    status: StatusCell,
    tracked: Mutex<Tracked>,
    head_pattern: RwLock<Option<Regex>>,
    last_error: RwLock<String>,
    /// Taken on close; tailers only get clones while the watch is open.
    channels: Mutex<Option<Channels>>,
    cancel: CancellationToken,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter) -> std::result::Result<(), fmt::Error> {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("status", &self.status.get())
            .field("tracked", &self.tracked.lock().tailers.keys())
            .finish()
    }
}

/// Discovers files matching a glob pattern, follows each of them
/// concurrently and merges their lines.
///
/// Discovery and expiry run in a background task started by the first call
/// to [`read_line`](PatternWatcher::read_line) or the first poll of the
/// watcher as a [`Stream`](futures_util::stream::Stream). Lines keep their
/// order within one file; lines of different files interleave arbitrarily.
///
/// Progress is only persisted by [`sync_meta`](PatternWatcher::sync_meta)
/// and [`close`](PatternWatcher::close). A line counts as delivered once it
/// was returned to the caller; until then it stays pending in its tailer and
/// is saved as such. Dropping the watcher without `close` stops every task
/// without saving anything.
#[derive(Debug)]
pub struct PatternWatcher {
    shared: Arc<Shared>,
    lines_rx: mpsc::Receiver<Delivery>,
    errors_rx: mpsc::Receiver<Error>,
    current: Option<PathBuf>,
}

impl PatternWatcher {
    /// Creates a watch, restoring pending lines saved in `store` by an
    /// earlier run. A missing or unreadable buffer starts an empty cache.
    pub fn new(config: WatchConfig, store: Arc<dyn OffsetStore>) -> Result<Self> {
        config.validate()?;

        let cache = load_cache(&config, store.as_ref());
        let (lines, lines_rx) = mpsc::channel(config.channel_capacity);
        let (errors, errors_rx) = mpsc::channel(config.channel_capacity);
        let head_pattern = config.head_pattern.clone();

        let shared = Shared {
            config,
            store,
            status: StatusCell::new(),
            tracked: Mutex::new(Tracked {
                tailers: HashMap::new(),
                cache,
            }),
            head_pattern: RwLock::new(head_pattern),
            last_error: RwLock::new(String::new()),
            channels: Mutex::new(Some(Channels { lines, errors })),
            cancel: CancellationToken::new(),
            run_handle: Mutex::new(None),
        };

        Ok(PatternWatcher {
            shared: Arc::new(shared),
            lines_rx,
            errors_rx,
            current: None,
        })
    }

    pub fn name(&self) -> String {
        format!("PatternWatcher:{}", self.shared.config.log_path)
    }

    /// Origin path of the most recently returned line.
    pub fn source(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Canonical paths of the files currently followed.
    pub fn tracked(&self) -> Vec<PathBuf> {
        self.shared.tracked.lock().tailers.keys().cloned().collect()
    }

    /// Sets the head-of-record pattern for files discovered from now on.
    pub fn set_head_pattern(&self, pattern: &str) -> Result<()> {
        let regex =
            Regex::new(pattern).map_err(|e| Error::Regex(format!("{}: {}", self.name(), e)))?;
        *self.shared.head_pattern.write() = Some(regex);
        Ok(())
    }

    /// Starts the discovery/expiry task if it is not running yet.
    pub fn start(&self) {
        let mut run_handle = self.shared.run_handle.lock();
        if self
            .shared
            .status
            .transition(TailStatus::Init, TailStatus::Running)
            .is_err()
        {
            return;
        }

        *run_handle = Some(tokio::spawn(Arc::clone(&self.shared).run()));
        tracing::info!(
            runner = %self.shared.config.runner_name,
            name = %self.name(),
            "Stat file daemon started"
        );
    }

    /// Runs one discovery pass.
    pub async fn discover(&self) {
        self.shared.discover().await
    }

    /// Runs one expiry pass.
    pub async fn expire(&self) {
        self.shared.expire().await
    }

    /// Waits up to one second for the next line.
    ///
    /// Returns `Ok(None)` on timeout and once the watch is closed, and
    /// `Err` for a read error forwarded by one of the files.
    pub async fn read_line(&mut self) -> Result<Option<Line>> {
        self.start();

        let lines = &mut self.lines_rx;
        let errors = &mut self.errors_rx;
        let next = time::timeout(READ_TIMEOUT, async {
            loop {
                tokio::select! {
                    Some(delivery) = lines.recv() => {
                        if let Some(line) = delivery.accept() {
                            return Ok(Some(line));
                        }
                    }
                    Some(err) = errors.recv() => return Err(err),
                    else => return Ok(None),
                }
            }
        })
        .await;

        match next {
            Ok(Ok(Some(line))) => {
                self.current = Some(line.source().to_path_buf());
                Ok(Some(line))
            }
            Ok(other) => other,
            Err(_elapsed) => Ok(None),
        }
    }

    /// Persists the offset of every file and the pending-line cache.
    pub async fn sync_meta(&self) {
        self.shared.sync_meta().await
    }

    /// Sums the unread bytes of every file. Files that fail to report are
    /// listed in [`LagInfo::errors`] and left out of the sum.
    pub async fn lag(&self) -> LagInfo {
        let mut info = LagInfo {
            size_unit: "bytes",
            ..LagInfo::default()
        };
        let mut errors = Vec::new();

        for tailer in self.shared.tailers() {
            match tailer.lag().await {
                Ok(size) => info.size += size,
                Err(e) => {
                    tracing::warn!(
                        runner = %self.shared.config.runner_name,
                        path = %tailer.origin().display(),
                        error = %e,
                        "Lag unavailable"
                    );
                    errors.push(format!("<{}>: {}", tailer.origin().display(), e));
                }
            }
        }
        if !errors.is_empty() {
            info.errors = Some(errors.join("\n"));
        }

        info
    }

    /// The watch's own last error followed by the last error of every file.
    pub fn status(&self) -> WatchStats {
        let mut last_error = self.shared.last_error.read().clone();
        for tailer in self.shared.tailers() {
            let err = tailer.last_error();
            if !err.is_empty() {
                last_error.push_str(&format!("\n<{}>: {}", tailer.origin().display(), err));
            }
        }

        WatchStats { last_error }
    }

    /// Drops the persisted state of the watch and of every tracked file.
    ///
    /// Every part is attempted; failures are reported together.
    pub async fn reset(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.shared.store.reset() {
            errors.push(e.to_string());
        }
        self.shared.tracked.lock().cache.clear();

        for tailer in self.shared.tailers() {
            if let Err(e) = tailer.reset().await {
                errors.push(format!("<{}>: {}", tailer.origin().display(), e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Reset(errors))
        }
    }

    /// Stops the watch: syncs progress, closes every tailer, then closes the
    /// line and error channels. Calling it again does nothing.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        let requested = shared
            .status
            .transition(TailStatus::Running, TailStatus::Stopping)
            .is_ok()
            || shared
                .status
                .transition(TailStatus::Init, TailStatus::Stopping)
                .is_ok();
        if !requested {
            return Ok(());
        }
        shared.cancel.cancel();

        time::sleep(CLOSE_GRACE).await;
        shared.sync_meta().await;

        let tailers = shared.tailers();
        let results = join_all(tailers.iter().map(|tailer| tailer.close())).await;
        let mut errors = Vec::new();
        for (tailer, res) in tailers.iter().zip(results) {
            if let Err(e) = res {
                tracing::error!(
                    runner = %shared.config.runner_name,
                    path = %tailer.origin().display(),
                    error = %e,
                    "Close tailer failed"
                );
                errors.push(e.to_string());
            }
        }

        let run_handle = shared.run_handle.lock().take();
        if let Some(mut handle) = run_handle {
            if time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
                errors.push(format!("{} did not stop in time", self.name()));
            }
        }

        // Every tailer has returned; dropping the last senders closes the
        // channels for the consumer.
        shared.tracked.lock().tailers.clear();
        shared.channels.lock().take();
        shared.status.finish();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }
}

impl Drop for PatternWatcher {
    fn drop(&mut self) {
        // Without a close nothing is synced; only the tasks are stopped
        let _ = self
            .shared
            .status
            .transition(TailStatus::Running, TailStatus::Stopping)
            .or_else(|_| {
                self.shared
                    .status
                    .transition(TailStatus::Init, TailStatus::Stopping)
            });
        self.shared.cancel.cancel();
    }
}

fn load_cache(config: &WatchConfig, store: &dyn OffsetStore) -> HashMap<PathBuf, String> {
    let buf = match store.read_buf() {
        Ok(Some(buf)) if !buf.is_empty() => buf,
        Ok(_) => {
            tracing::debug!(
                runner = %config.runner_name,
                log_path = %config.log_path,
                "No saved cache, starting empty"
            );
            return HashMap::new();
        }
        Err(e) => {
            tracing::warn!(
                runner = %config.runner_name,
                log_path = %config.log_path,
                error = %e,
                "Recover from meta failed, ignoring it"
            );
            return HashMap::new();
        }
    };

    serde_json::from_slice(&buf).unwrap_or_else(|e| {
        tracing::warn!(
            runner = %config.runner_name,
            log_path = %config.log_path,
            error = %e,
            "Saved cache is corrupt, ignoring it"
        );
        HashMap::new()
    })
}

impl Shared {
    fn tailers(&self) -> Vec<Arc<FileTailer>> {
        self.tracked.lock().tailers.values().cloned().collect()
    }

    fn runner(&self) -> &str {
        &self.config.runner_name
    }

    fn set_last_error(&self, err: String) {
        *self.last_error.write() = err;
    }

    async fn close_abandoned(&self, tailer: &FileTailer) {
        if let Err(e) = tailer.close().await {
            tracing::error!(
                runner = %self.runner(),
                path = %tailer.origin().display(),
                error = %e,
                "Close abandoned tailer failed"
            );
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.status.get().is_stopping() || self.cancel.is_cancelled() {
                tracing::warn!(
                    runner = %self.runner(),
                    log_path = %self.config.log_path,
                    "Stopped from running"
                );
                return;
            }

            self.expire().await;
            self.discover().await;

            tokio::select! {
                _ = time::sleep(self.config.stat_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    async fn expire(&self) {
        if self.status.get().is_stopping() {
            return;
        }

        let tailers: Vec<(PathBuf, Arc<FileTailer>)> = self
            .tracked
            .lock()
            .tailers
            .iter()
            .map(|(identity, tailer)| (identity.clone(), Arc::clone(tailer)))
            .collect();

        let mut expired = Vec::new();
        for (identity, tailer) in tailers {
            if self.status.get().is_stopping() {
                break;
            }
            if !tailer.expired(self.config.expire).await {
                continue;
            }

            if let Err(e) = tailer.close().await {
                tracing::error!(
                    runner = %self.runner(),
                    path = %tailer.origin().display(),
                    error = %e,
                    "Close expired tailer failed"
                );
            }
            {
                let mut tracked = self.tracked.lock();
                tracked.tailers.remove(&identity);
                tracked.cache.remove(&identity);
            }
            if let Err(e) = self.store.remove_sub_meta(&identity) {
                tracing::error!(
                    runner = %self.runner(),
                    path = %identity.display(),
                    error = %e,
                    "Remove submeta failed"
                );
            }
            expired.push(identity.display().to_string());
        }

        if !expired.is_empty() {
            tracing::info!(
                runner = %self.runner(),
                paths = %expired.join(", "),
                "Expired log paths"
            );
        }
    }

    async fn discover(&self) {
        if self.status.get().is_stopping() {
            return;
        }

        let max_open_files = self.config.max_open_files;
        if self.tracked.lock().tailers.len() >= max_open_files {
            tracing::warn!(
                runner = %self.runner(),
                log_path = %self.config.log_path,
                max_open_files,
                "Max open files reached, not looking for new logs"
            );
            return;
        }

        let matches = match glob_matches(&self.config.log_path) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!(
                    runner = %self.runner(),
                    log_path = %self.config.log_path,
                    error = %e,
                    "Stat log path pattern failed"
                );
                self.set_last_error(format!("stat log path pattern failed: {}", e));
                return;
            }
        };

        let mut added = Vec::new();
        for origin in matches {
            let (identity, meta) = match real_path(&origin).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::error!(
                        runner = %self.runner(),
                        path = %origin.display(),
                        error = %e,
                        "Stat match failed, ignoring it"
                    );
                    continue;
                }
            };
            if meta.is_dir() {
                tracing::debug!(
                    runner = %self.runner(),
                    path = %origin.display(),
                    "Match is a directory, ignoring it"
                );
                continue;
            }

            let cached = {
                let tracked = self.tracked.lock();
                if tracked.tailers.contains_key(&identity) {
                    tracing::debug!(
                        runner = %self.runner(),
                        path = %identity.display(),
                        "Already collecting"
                    );
                    continue;
                }
                if tracked.tailers.len() >= max_open_files {
                    tracing::warn!(
                        runner = %self.runner(),
                        max_open_files,
                        "Max open files reached, leaving the rest for the next pass"
                    );
                    break;
                }
                tracked.cache.get(&identity).cloned()
            };

            // Old files are only picked up if they still hold an unsent line
            let stale = meta
                .modified()
                .map(|modified| is_stale(modified, self.config.expire))
                .unwrap_or(false);
            if cached.is_none() && stale {
                tracing::debug!(
                    runner = %self.runner(),
                    path = %origin.display(),
                    "Match is expired, ignoring it"
                );
                continue;
            }

            let channels = match self.channels.lock().clone() {
                Some(channels) => channels,
                None => return,
            };
            let tailer = match FileTailer::open(
                &origin,
                &identity,
                self.config.whence,
                Arc::clone(&self.store),
                channels,
                self.cancel.child_token(),
                self.runner(),
            )
            .await
            {
                Ok(tailer) => tailer,
                Err(e) => {
                    tracing::error!(
                        runner = %self.runner(),
                        path = %identity.display(),
                        error = %e,
                        "Open tailer failed, ignoring this match"
                    );
                    self.set_last_error(format!("open {} failed: {}", origin.display(), e));
                    continue;
                }
            };

            if let Some(line) = cached {
                tailer.seed_pending(line).await;
            }
            let head_pattern = self.head_pattern.read().clone();
            if let Some(pattern) = head_pattern {
                if let Err(e) = tailer.set_head_pattern(pattern).await {
                    tracing::error!(
                        runner = %self.runner(),
                        path = %identity.display(),
                        error = %e,
                        "Set head pattern failed"
                    );
                    self.set_last_error(format!(
                        "set head pattern for {} failed: {}",
                        identity.display(),
                        e
                    ));
                }
            }

            let admitted = {
                let mut tracked = self.tracked.lock();
                if self.status.get().is_stopping() || tracked.tailers.len() >= max_open_files {
                    Admit::Full
                } else if tracked.tailers.contains_key(&identity) {
                    Admit::Duplicate
                } else {
                    tracked.tailers.insert(identity.clone(), Arc::clone(&tailer));
                    tailer.start();
                    Admit::Added
                }
            };
            match admitted {
                Admit::Added => {}
                Admit::Duplicate => {
                    self.close_abandoned(&tailer).await;
                    continue;
                }
                Admit::Full => {
                    tracing::warn!(
                        runner = %self.runner(),
                        path = %origin.display(),
                        "Watch stopped or full while opening tailer, dropping it"
                    );
                    self.close_abandoned(&tailer).await;
                    break;
                }
            }

            if let Err(e) = self.store.add_sub_meta(&identity) {
                tracing::error!(
                    runner = %self.runner(),
                    path = %identity.display(),
                    error = %e,
                    "Add submeta failed, tailer keeps working"
                );
            }
            added.push(identity.display().to_string());
        }

        if !added.is_empty() {
            tracing::info!(
                runner = %self.runner(),
                paths = %added.join(", "),
                "Found new log paths"
            );
        }
    }

    async fn sync_meta(&self) {
        for tailer in self.tailers() {
            let pending = tailer.sync_meta().await;
            let identity = tailer.identity().to_path_buf();
            let mut tracked = self.tracked.lock();
            match pending.filter(|line| !line.is_empty()) {
                Some(line) => {
                    tracked.cache.insert(identity, line);
                }
                // A seeded line goes out before anything else, so the cached
                // one was delivered already
                None => {
                    tracked.cache.remove(&identity);
                }
            }
        }

        let buf = serde_json::to_vec(&self.tracked.lock().cache);
        let buf = match buf {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!(
                    runner = %self.runner(),
                    log_path = %self.config.log_path,
                    error = %e,
                    "Serialize cache failed"
                );
                return;
            }
        };

        if let Err(e) = self.store.write_buf(&buf) {
            tracing::error!(
                runner = %self.runner(),
                log_path = %self.config.log_path,
                error = %e,
                "Write cache failed"
            );
        }
    }
}

impl FuturesStream for PatternWatcher {
    type Item = Result<Line>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.start();

        let lines_closed = loop {
            match this.lines_rx.poll_recv(cx) {
                task::Poll::Ready(Some(delivery)) => {
                    // Left behind by a stopped tailer, which still holds it
                    let line = match delivery.accept() {
                        Some(line) => line,
                        None => continue,
                    };
                    this.current = Some(line.source().to_path_buf());
                    return task::Poll::Ready(Some(Ok(line)));
                }
                task::Poll::Ready(None) => break true,
                task::Poll::Pending => break false,
            }
        };

        match this.errors_rx.poll_recv(cx) {
            task::Poll::Ready(Some(err)) => task::Poll::Ready(Some(Err(err))),
            task::Poll::Ready(None) if lines_closed => task::Poll::Ready(None),
            _ => task::Poll::Pending,
        }
    }
}
