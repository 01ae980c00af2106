//! Watch configuration.
//!
//! [`RawWatchConfig`] is the serde-facing shape with durations as
//! human-readable strings (`"24h"`, `"3m"`). It is turned into a validated
//! [`WatchConfig`] with `TryFrom`, which is the only place configuration
//! errors are raised.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Where a newly tracked file starts being read from when no saved offset
/// exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Whence {
    /// Read the whole file from the beginning.
    #[default]
    Oldest,
    /// Only read content appended after the file was discovered.
    Newest,
}

impl FromStr for Whence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oldest" => Ok(Whence::Oldest),
            "newest" => Ok(Whence::Newest),
            other => Err(Error::Config(format!(
                "read_from must be one of oldest|newest, got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Whence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Whence::Oldest => f.write_str("oldest"),
            Whence::Newest => f.write_str("newest"),
        }
    }
}

/// Unvalidated configuration, as read from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWatchConfig {
    /// Glob pattern selecting the files to follow.
    pub log_path: String,
    #[serde(default = "default_read_from")]
    pub read_from: String,
    #[serde(default = "default_expire")]
    pub expire: String,
    #[serde(default = "default_stat_interval")]
    pub stat_interval: String,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
    /// Regex matching the first line of a multi-line record.
    #[serde(default)]
    pub head_pattern: Option<String>,
    /// Label attached to every log event of this watch.
    #[serde(default)]
    pub runner_name: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_read_from() -> String {
    Whence::Oldest.to_string()
}

fn default_expire() -> String {
    "24h".to_string()
}

fn default_stat_interval() -> String {
    "3m".to_string()
}

fn default_max_open_files() -> usize {
    256
}

fn default_channel_capacity() -> usize {
    1
}

/// Validated configuration of one watch.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub log_path: String,
    pub whence: Whence,
    /// Files untouched for longer than this are not picked up, and tracked
    /// files that stopped growing are released.
    pub expire: Duration,
    /// Delay between discovery passes.
    pub stat_interval: Duration,
    pub max_open_files: usize,
    pub head_pattern: Option<Regex>,
    pub runner_name: String,
    /// Capacity of the shared line channel. `1` keeps at most one line in
    /// flight between the tailers and the consumer.
    pub channel_capacity: usize,
}

impl WatchConfig {
    /// Creates a configuration for `log_path` with every other option at its
    /// default.
    pub fn new(log_path: impl Into<String>) -> Self {
        WatchConfig {
            log_path: log_path.into(),
            whence: Whence::Oldest,
            expire: Duration::from_secs(24 * 60 * 60),
            stat_interval: Duration::from_secs(3 * 60),
            max_open_files: default_max_open_files(),
            head_pattern: None,
            runner_name: String::new(),
            channel_capacity: default_channel_capacity(),
        }
    }

    pub fn with_whence(mut self, whence: Whence) -> Self {
        self.whence = whence;
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn with_stat_interval(mut self, stat_interval: Duration) -> Self {
        self.stat_interval = stat_interval;
        self
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    pub fn with_head_pattern(mut self, head_pattern: Regex) -> Self {
        self.head_pattern = Some(head_pattern);
        self
    }

    pub fn with_runner_name(mut self, runner_name: impl Into<String>) -> Self {
        self.runner_name = runner_name.into();
        self
    }

    /// Checks the invariants `TryFrom` enforces, for configurations built in
    /// code.
    pub fn validate(&self) -> Result<()> {
        if self.log_path.trim().is_empty() {
            return Err(Error::Config("log_path must not be empty".to_string()));
        }
        if self.max_open_files == 0 {
            return Err(Error::Config(
                "max_open_files must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::Config(format!("{} {:?} is not a valid duration: {}", key, value, e)))
}

impl TryFrom<RawWatchConfig> for WatchConfig {
    type Error = Error;

    fn try_from(raw: RawWatchConfig) -> Result<Self> {
        let head_pattern = match raw.head_pattern.as_deref() {
            Some(pattern) if !pattern.is_empty() => {
                Some(Regex::new(pattern).map_err(|e| Error::Regex(e.to_string()))?)
            }
            _ => None,
        };

        let config = WatchConfig {
            log_path: raw.log_path,
            whence: raw.read_from.parse()?,
            expire: parse_duration("expire", &raw.expire)?,
            stat_interval: parse_duration("stat_interval", &raw.stat_interval)?,
            max_open_files: raw.max_open_files,
            head_pattern,
            runner_name: raw.runner_name,
            channel_capacity: raw.channel_capacity,
        };
        config.validate()?;

        Ok(config)
    }
}
