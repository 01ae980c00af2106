//! Following a single file.
//!
//! A [`FileTailer`] owns one [`LineSource`] and runs its own task: read a
//! line, hold it as the pending line, hand it to the shared line channel,
//! repeat. The pending line only leaves the tailer once the consumer has
//! accepted the [`Delivery`] carrying it, so a stop while the line sits in
//! the channel keeps it for the next run.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Whence;
use crate::discovery::is_stale;
use crate::error::{Error, Result};
use crate::source::{FileLineSource, LineSource};
use crate::store::OffsetStore;

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(3);
const EOF_BACKOFF: Duration = Duration::from_secs(5);
const EMPTY_READ_BACKOFF: Duration = Duration::from_secs(1);
/// Roughly one hour of empty reads at one per second.
const MAX_EMPTY_READS: u32 = 60 * 60;
const DELIVERY_TICK: Duration = Duration::from_secs(1);
const STALL_REPORT_TICKS: u64 = 3000;
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// A line captured for a given source path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Line {
    /// The path from where the line was read, as matched by the pattern.
    source: PathBuf,
    line: String,
}

impl Line {
    pub fn new(source: impl Into<PathBuf>, line: impl Into<String>) -> Self {
        Line {
            source: source.into(),
            line: line.into(),
        }
    }

    /// Returns a reference to the path from where the line was read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns a reference to the line.
    pub fn line(&self) -> &str {
        self.line.as_str()
    }

    /// Returns the internal components that make up a `Line`.
    pub fn into_inner(self) -> (PathBuf, String) {
        let Line { source, line } = self;

        (source, line)
    }
}

/// A line on its way to the consumer.
///
/// The tailer keeps the line pending until [`accept`](Delivery::accept) is
/// called; a delivery dropped unaccepted is sent again.
#[derive(Debug)]
pub struct Delivery {
    line: Line,
    ack: oneshot::Sender<()>,
}

impl Delivery {
    fn new(line: Line) -> (Self, oneshot::Receiver<()>) {
        let (ack, acked) = oneshot::channel();
        (Delivery { line, ack }, acked)
    }

    /// Confirms receipt and hands out the line. Returns `None` if the tailer
    /// stopped waiting, in which case it still holds the line as pending.
    pub fn accept(self) -> Option<Line> {
        let Delivery { line, ack } = self;
        ack.send(()).ok().map(|_| line)
    }
}

/// Lifecycle of a tailer. Moves forward only; `Stopped` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TailStatus {
    Init = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl TailStatus {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: TailStatus) -> bool {
        use TailStatus::*;

        matches!(
            (self, next),
            (Init, Running) | (Init, Stopping) | (Running, Stopping) | (Stopping, Stopped)
        )
    }

    pub fn is_stopping(self) -> bool {
        matches!(self, TailStatus::Stopping | TailStatus::Stopped)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TailStatus::Init,
            1 => TailStatus::Running,
            2 => TailStatus::Stopping,
            _ => TailStatus::Stopped,
        }
    }
}

/// [`TailStatus`] behind an atomic, with transitions checked against
/// [`TailStatus::can_transition_to`].
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        StatusCell(AtomicU8::new(TailStatus::Init as u8))
    }
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> TailStatus {
        TailStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves from `from` to `to` if the cell currently holds `from`.
    ///
    /// Returns the status actually found on failure.
    pub fn transition(&self, from: TailStatus, to: TailStatus) -> std::result::Result<(), TailStatus> {
        if !from.can_transition_to(to) {
            return Err(self.get());
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(TailStatus::from_u8)
    }

    /// Walks the cell forward until it reaches `Stopped`.
    pub fn finish(&self) {
        loop {
            let current = self.get();
            let next = match current {
                TailStatus::Init | TailStatus::Running => TailStatus::Stopping,
                TailStatus::Stopping => TailStatus::Stopped,
                TailStatus::Stopped => return,
            };
            let _ = self.transition(current, next);
        }
    }
}

/// Sending halves of the channels every tailer of a watch shares.
#[derive(Clone, Debug)]
pub struct Channels {
    pub lines: mpsc::Sender<Delivery>,
    pub errors: mpsc::Sender<Error>,
}

#[derive(Debug)]
struct LineState {
    source: Box<dyn LineSource>,
    /// Read but not yet accepted by the line channel.
    pending: Option<String>,
}

enum Fill {
    Pending,
    Eof,
    Empty,
    Failed(io::Error),
}

/// Follows one file and forwards its lines to the shared channels.
pub struct FileTailer {
    origin: PathBuf,
    identity: PathBuf,
    runner: String,
    status: StatusCell,
    inactive: AtomicBool,
    state: Mutex<LineState>,
    last_error: RwLock<String>,
    channels: Channels,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Debug for FileTailer {
    fn fmt(&self, f: &mut Formatter) -> std::result::Result<(), fmt::Error> {
        f.debug_struct("FileTailer")
            .field("origin", &self.origin)
            .field("identity", &self.identity)
            .field("status", &self.status.get())
            .field("inactive", &self.inactive.load(Ordering::SeqCst))
            .finish()
    }
}

impl FileTailer {
    /// Opens `identity` through a [`FileLineSource`].
    ///
    /// `origin` is the path as matched by the pattern and is what lines are
    /// tagged with; `identity` is its canonical form.
    pub async fn open(
        origin: impl Into<PathBuf>,
        identity: impl Into<PathBuf>,
        whence: Whence,
        store: Arc<dyn OffsetStore>,
        channels: Channels,
        cancel: CancellationToken,
        runner: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let identity = identity.into();
        let source = FileLineSource::open(identity.clone(), whence, store).await?;

        Ok(Self::with_source(
            origin,
            identity,
            Box::new(source),
            channels,
            cancel,
            runner,
        ))
    }

    /// Builds a tailer around an arbitrary line source.
    ///
    /// Cancelling `cancel` stops the tailer like [`close`](Self::close) does,
    /// minus releasing the source.
    pub fn with_source(
        origin: impl Into<PathBuf>,
        identity: impl Into<PathBuf>,
        source: Box<dyn LineSource>,
        channels: Channels,
        cancel: CancellationToken,
        runner: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(FileTailer {
            origin: origin.into(),
            identity: identity.into(),
            runner: runner.into(),
            status: StatusCell::new(),
            // Nothing was read yet, so nothing keeps the file alive
            inactive: AtomicBool::new(true),
            state: Mutex::new(LineState {
                source,
                pending: None,
            }),
            last_error: RwLock::new(String::new()),
            channels,
            cancel,
            task: parking_lot::Mutex::new(None),
        })
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn identity(&self) -> &Path {
        &self.identity
    }

    pub fn status(&self) -> TailStatus {
        self.status.get()
    }

    pub fn is_inactive(&self) -> bool {
        self.inactive.load(Ordering::SeqCst)
    }

    /// Text of the most recent read error, empty if there was none.
    pub fn last_error(&self) -> String {
        self.last_error.read().clone()
    }

    pub async fn set_head_pattern(&self, pattern: Regex) -> Result<()> {
        self.state.lock().await.source.set_head_pattern(pattern)
    }

    /// Installs a line left over from a previous run; it is delivered before
    /// anything read from the source.
    pub async fn seed_pending(&self, line: String) {
        if !line.is_empty() {
            self.state.lock().await.pending = Some(line);
        }
    }

    /// Spawns the read loop. Returns `false` if the tailer was already
    /// started or closed.
    pub fn start(self: &Arc<Self>) -> bool {
        if let Err(found) = self.status.transition(TailStatus::Init, TailStatus::Running) {
            tracing::error!(
                runner = %self.runner,
                path = %self.origin.display(),
                status = ?found,
                "Tailer was not in Init before running, not starting it"
            );
            return false;
        }

        let handle = tokio::spawn(Arc::clone(self).run());
        *self.task.lock() = Some(handle);

        true
    }

    fn stop_requested(&self) -> bool {
        self.status.get().is_stopping() || self.cancel.is_cancelled()
    }

    async fn backoff(&self, delay: Duration) {
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn send_error(&self, err: Error) {
        tokio::select! {
            res = self.channels.errors.send(err) => {
                if res.is_err() {
                    tracing::debug!(
                        runner = %self.runner,
                        path = %self.origin.display(),
                        "Error channel closed, dropping error"
                    );
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn fill_pending(&self) -> Fill {
        let mut state = self.state.lock().await;
        if state.pending.is_some() {
            return Fill::Pending;
        }

        match state.source.read_line().await {
            Ok(read) if !read.line.is_empty() => {
                state.pending = Some(read.line);
                Fill::Pending
            }
            Ok(read) if read.eof => Fill::Eof,
            Ok(_) => Fill::Empty,
            Err(e) => Fill::Failed(e),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut tick = time::interval(DELIVERY_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut empty_reads: u32 = 0;

        loop {
            if self.stop_requested() {
                self.status.finish();
                tracing::warn!(
                    runner = %self.runner,
                    path = %self.origin.display(),
                    "Tailer was stopped"
                );
                return;
            }

            match self.fill_pending().await {
                Fill::Pending => {}
                Fill::Failed(e) => {
                    tracing::warn!(
                        runner = %self.runner,
                        path = %self.origin.display(),
                        error = %e,
                        "Read error"
                    );
                    *self.last_error.write() = e.to_string();
                    self.send_error(Error::Read {
                        path: self.origin.clone(),
                        source: e,
                    })
                    .await;
                    self.backoff(READ_ERROR_BACKOFF).await;
                    continue;
                }
                Fill::Eof => {
                    empty_reads = empty_reads.saturating_add(1);
                    self.inactive.store(true, Ordering::SeqCst);
                    tracing::debug!(
                        runner = %self.runner,
                        path = %self.origin.display(),
                        "Reached EOF, tailer is inactive now"
                    );
                    self.backoff(EOF_BACKOFF).await;
                    continue;
                }
                Fill::Empty => {
                    empty_reads = empty_reads.saturating_add(1);
                    if empty_reads > MAX_EMPTY_READS {
                        self.inactive.store(true, Ordering::SeqCst);
                    }
                    self.backoff(EMPTY_READ_BACKOFF).await;
                    continue;
                }
            }

            self.inactive.store(false, Ordering::SeqCst);
            empty_reads = 0;

            if !self.deliver(&mut tick).await {
                self.status.finish();
                tracing::debug!(
                    runner = %self.runner,
                    path = %self.origin.display(),
                    "Tailer was stopped while waiting to send data"
                );
                return;
            }
        }
    }

    /// Hands the pending line to the consumer and waits until it is
    /// accepted. Returns `false` if the tailer has to stop first.
    async fn deliver(&self, tick: &mut Interval) -> bool {
        let mut repeat: u64 = 0;
        let mut acked: Option<oneshot::Receiver<()>> = None;

        loop {
            if self.stop_requested() {
                self.settle(acked).await;
                return false;
            }

            repeat += 1;
            if repeat % STALL_REPORT_TICKS == 0 {
                tracing::error!(
                    runner = %self.runner,
                    path = %self.origin.display(),
                    repeat,
                    "Pending line is still waiting to be delivered"
                );
            }

            if acked.is_none() {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => return false,
                    permit = self.channels.lines.reserve() => {
                        let permit = match permit {
                            Ok(permit) => permit,
                            Err(_) => {
                                tracing::debug!(
                                    runner = %self.runner,
                                    path = %self.origin.display(),
                                    "Line channel closed"
                                );
                                return false;
                            }
                        };
                        let line = match self.state.lock().await.pending.clone() {
                            Some(line) => line,
                            None => return true,
                        };
                        let (delivery, ack) = Delivery::new(Line::new(self.origin.clone(), line));
                        permit.send(delivery);
                        acked = Some(ack);
                    }
                    _ = tick.tick() => {}
                }
                continue;
            }

            let accepted = match acked.as_mut() {
                Some(ack) => tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => None,
                    res = ack => Some(res.is_ok()),
                    _ = tick.tick() => continue,
                },
                None => continue,
            };

            match accepted {
                Some(true) => {
                    self.state.lock().await.pending = None;
                    return true;
                }
                // Dropped unaccepted, offer it again
                Some(false) => acked = None,
                None => {
                    self.settle(acked).await;
                    return false;
                }
            }
        }
    }

    /// Clears the pending line if its delivery was accepted right before a
    /// stop.
    async fn settle(&self, acked: Option<oneshot::Receiver<()>>) {
        if let Some(mut ack) = acked {
            if ack.try_recv().is_ok() {
                self.state.lock().await.pending = None;
            }
        }
    }

    /// Returns whether the tailer can be released: the file is gone, or it is
    /// both older than `expire` and fully drained.
    pub async fn expired(&self, expire: Duration) -> bool {
        let meta = match tokio::fs::metadata(&self.identity).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) => {
                tracing::error!(
                    runner = %self.runner,
                    path = %self.origin.display(),
                    error = %e,
                    "Stat failed, will not expire it"
                );
                return false;
            }
        };

        let modified = match meta.modified() {
            Ok(modified) => modified,
            Err(e) => {
                tracing::error!(
                    runner = %self.runner,
                    path = %self.origin.display(),
                    error = %e,
                    "No modification time, will not expire it"
                );
                return false;
            }
        };

        is_stale(modified, expire) && self.is_inactive()
    }

    /// Persists the source offset and returns the pending line, if any.
    pub async fn sync_meta(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        if let Err(e) = state.source.sync_meta() {
            tracing::error!(
                runner = %self.runner,
                path = %self.origin.display(),
                error = %e,
                "Failed to sync offset"
            );
        }

        state.pending.clone()
    }

    pub async fn lag(&self) -> io::Result<u64> {
        self.state.lock().await.source.lag().await
    }

    /// Forgets the persisted offset of the source.
    pub async fn reset(&self) -> Result<()> {
        self.state.lock().await.source.reset()
    }

    /// Stops the read loop and releases the source.
    ///
    /// Fails with [`Error::CloseTimeout`] if the loop did not finish within
    /// three seconds, in which case its task is aborted.
    pub async fn close(&self) -> Result<()> {
        let requested = self
            .status
            .transition(TailStatus::Running, TailStatus::Stopping)
            .is_ok()
            || self
                .status
                .transition(TailStatus::Init, TailStatus::Stopping)
                .is_ok();
        self.cancel.cancel();

        let mut result = Ok(());
        if requested {
            tracing::warn!(
                runner = %self.runner,
                path = %self.origin.display(),
                "Tailer is closing"
            );
        }

        // The task may be winding down on its own after a cancel from the
        // watch; join it either way
        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            match time::timeout(CLOSE_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        runner = %self.runner,
                        path = %self.origin.display(),
                        error = %e,
                        "Tailer task failed"
                    );
                }
                Err(_) => {
                    handle.abort();
                    tracing::error!(
                        runner = %self.runner,
                        path = %self.origin.display(),
                        "Tailer did not stop in time, aborted it"
                    );
                    result = Err(Error::CloseTimeout(self.origin.clone()));
                }
            }
        }
        self.status.finish();

        match time::timeout(CLOSE_TIMEOUT, self.state.lock()).await {
            Ok(mut state) => state.source.close(),
            Err(_) => {
                tracing::error!(
                    runner = %self.runner,
                    path = %self.origin.display(),
                    "Line source is still busy, leaving it open"
                );
            }
        }

        if requested {
            tracing::warn!(
                runner = %self.runner,
                path = %self.origin.display(),
                "Tailer was closed"
            );
        }

        result
    }
}
