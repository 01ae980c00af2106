//! Error type shared by every part of the watch.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid head pattern: {0}")]
    Regex(String),

    #[error("Invalid glob pattern: {0}")]
    Glob(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Read error on {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Tailer for {} did not stop in time", .0.display())]
    CloseTimeout(PathBuf),

    #[error("{}", .0.join("\n"))]
    Close(Vec<String>),

    #[error("{}", .0.join("\n"))]
    Reset(Vec<String>),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_error_display() {
        let err = Error::Read {
            path: PathBuf::from("/var/log/app.log"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "Read error on /var/log/app.log: denied");
    }

    #[test]
    fn test_joined_errors_display() {
        let err = Error::Reset(vec!["first".to_string(), "second".to_string()]);
        assert_eq!(err.to_string(), "first\nsecond");
    }

    #[test]
    fn test_from_io_error() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
