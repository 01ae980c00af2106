//! Everything related to reading lines out of a single file.

use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs::{metadata, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use crate::config::Whence;
use crate::error::Result;
use crate::store::OffsetStore;

/// Outcome of a single [`LineSource::read_line`] call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadLine {
    /// The line or joined record; empty if nothing was available.
    pub line: String,
    /// `true` if the end of the file was reached without producing a line.
    pub eof: bool,
}

impl ReadLine {
    pub fn line(line: impl Into<String>) -> Self {
        ReadLine {
            line: line.into(),
            eof: false,
        }
    }

    pub fn eof() -> Self {
        ReadLine {
            line: String::new(),
            eof: true,
        }
    }

    pub fn empty() -> Self {
        ReadLine::default()
    }
}

/// Sequential reader of one file, tracking its own resumable offset.
#[async_trait]
pub trait LineSource: Send + Sync + Debug {
    /// Reads the next line. Never blocks waiting for new data.
    async fn read_line(&mut self) -> io::Result<ReadLine>;

    /// Persists the offset just past the last line returned.
    fn sync_meta(&mut self) -> Result<()>;

    /// Bytes not yet returned.
    async fn lag(&self) -> io::Result<u64>;

    /// Joins lines into records that start with a line matching `pattern`.
    fn set_head_pattern(&mut self, pattern: Regex) -> Result<()>;

    /// Forgets the persisted offset.
    fn reset(&mut self) -> Result<()>;

    /// Releases the file handle. Later reads fail.
    fn close(&mut self);
}

type LineReader = BufReader<File>;

async fn new_linereader(path: impl AsRef<Path>, seek_pos: u64) -> io::Result<LineReader> {
    let mut reader = File::open(path.as_ref()).await?;
    if seek_pos > 0 {
        reader.seek(io::SeekFrom::Start(seek_pos)).await?;
    }

    Ok(BufReader::new(reader))
}

/// Record being assembled under a head pattern.
#[derive(Debug)]
struct Record {
    text: String,
    /// Set once an end-of-file was seen with this record buffered; the next
    /// one flushes it.
    stale: bool,
}

impl Record {
    fn new(text: String) -> Self {
        Record { text, stale: false }
    }
}

/// [`LineSource`] over a regular file.
///
/// Lines are `\n`-terminated; a trailing `\r` is dropped and blank lines are
/// skipped. An unterminated last line is held back until its newline is
/// written. If the file shrinks below the current position it is treated as
/// truncated and read again from the start.
#[derive(Debug)]
pub struct FileLineSource {
    path: PathBuf,
    store: Arc<dyn OffsetStore>,
    reader: Option<LineReader>,
    /// Position just past the last line handed out.
    offset: u64,
    /// Position just past the last complete line read from the file.
    read_pos: u64,
    partial: Vec<u8>,
    head_pattern: Option<Regex>,
    record: Option<Record>,
}

impl FileLineSource {
    /// Opens `path`, resuming from the offset saved in `store` if there is
    /// one, or else from the position selected by `whence`.
    pub async fn open(
        path: impl Into<PathBuf>,
        whence: Whence,
        store: Arc<dyn OffsetStore>,
    ) -> Result<Self> {
        let path = path.into();
        let size = metadata(&path).await?.len();

        let offset = match store.read_offset(&path)? {
            // A saved offset past the end means the file was replaced
            Some(saved) if saved <= size => saved,
            Some(_) => 0,
            None => match whence {
                Whence::Oldest => 0,
                Whence::Newest => size,
            },
        };
        let reader = new_linereader(&path, offset).await?;

        Ok(FileLineSource {
            path,
            store,
            reader: Some(reader),
            offset,
            read_pos: offset,
            partial: Vec::new(),
            head_pattern: None,
            record: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads one complete raw line, or `None` at the end of the file.
    async fn next_raw_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let reader = self.reader.as_mut().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "line source is closed")
            })?;

            let n = reader.read_until(b'\n', &mut self.partial).await?;
            if n > 0 && self.partial.ends_with(b"\n") {
                self.read_pos += self.partial.len() as u64;
                let mut bytes = std::mem::take(&mut self.partial);
                bytes.pop();
                if bytes.ends_with(b"\r") {
                    bytes.pop();
                }
                if bytes.is_empty() {
                    continue;
                }
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }

            // End of file: check whether it was truncated behind us
            let size = metadata(&self.path).await?.len();
            if size < self.read_pos + self.partial.len() as u64 {
                tracing::warn!(
                    path = %self.path.display(),
                    old_offset = self.read_pos,
                    new_len = size,
                    "File truncated, reading again from the start"
                );
                self.reader = Some(new_linereader(&self.path, 0).await?);
                self.offset = 0;
                self.read_pos = 0;
                self.partial.clear();
                self.record = None;
                continue;
            }

            return Ok(None);
        }
    }

    async fn read_record(&mut self) -> io::Result<ReadLine> {
        loop {
            let line_start = self.read_pos;
            let line = match self.next_raw_line().await? {
                Some(line) => line,
                None => {
                    let stale = match self.record.as_mut() {
                        None => return Ok(ReadLine::eof()),
                        Some(record) => std::mem::replace(&mut record.stale, true),
                    };
                    // Give the writer one more round to finish the record
                    if !stale {
                        return Ok(ReadLine::empty());
                    }
                    let record = self.record.take().map(|r| r.text).unwrap_or_default();
                    self.offset = self.read_pos;
                    return Ok(ReadLine::line(record));
                }
            };

            let is_head = self
                .head_pattern
                .as_ref()
                .map_or(true, |pattern| pattern.is_match(&line));

            if is_head && self.record.is_some() {
                let done = self.record.replace(Record::new(line));
                self.offset = line_start;
                return Ok(ReadLine::line(done.map(|r| r.text).unwrap_or_default()));
            }

            match self.record.as_mut() {
                Some(record) => {
                    record.text.push('\n');
                    record.text.push_str(&line);
                    record.stale = false;
                }
                None => self.record = Some(Record::new(line)),
            }
        }
    }
}

#[async_trait]
impl LineSource for FileLineSource {
    async fn read_line(&mut self) -> io::Result<ReadLine> {
        if self.head_pattern.is_some() {
            return self.read_record().await;
        }

        match self.next_raw_line().await? {
            Some(line) => {
                self.offset = self.read_pos;
                Ok(ReadLine::line(line))
            }
            None => Ok(ReadLine::eof()),
        }
    }

    fn sync_meta(&mut self) -> Result<()> {
        self.store.write_offset(&self.path, self.offset)
    }

    async fn lag(&self) -> io::Result<u64> {
        let size = metadata(&self.path).await?.len();
        Ok(size.saturating_sub(self.offset))
    }

    fn set_head_pattern(&mut self, pattern: Regex) -> Result<()> {
        self.head_pattern = Some(pattern);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.store.reset_offset(&self.path)
    }

    fn close(&mut self) {
        self.reader = None;
    }
}
