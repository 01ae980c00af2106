//! Finding the files a pattern currently refers to.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

/// Expands `pattern`, skipping entries that could not be read.
pub fn glob_matches(pattern: &str) -> Result<Vec<PathBuf>> {
    let entries = glob::glob(pattern).map_err(|e| Error::Glob(e.to_string()))?;

    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => {
                tracing::error!(
                    path = %e.path().display(),
                    error = %e.error(),
                    "Unreadable glob match, ignoring it"
                );
            }
        }
    }

    Ok(paths)
}

/// Resolves `path` to its canonical, symlink-free form and stats the target.
pub async fn real_path(path: impl AsRef<Path>) -> io::Result<(PathBuf, Metadata)> {
    let real = tokio::fs::canonicalize(path.as_ref()).await?;
    let meta = tokio::fs::metadata(&real).await?;

    Ok((real, meta))
}

/// `true` if `modified` is more than `expire` in the past.
pub fn is_stale(modified: SystemTime, expire: Duration) -> bool {
    match modified.checked_add(expire) {
        Some(deadline) => deadline < SystemTime::now(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_glob_matches() {
        let dir = TempDir::new().unwrap();
        for name in &["app-1.log", "app-2.log", "other.txt"] {
            fs::write(dir.path().join(name), "x\n").unwrap();
        }

        let pattern = format!("{}/app-*.log", dir.path().display());
        let files = glob_matches(&pattern).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.extension().unwrap() == "log"));
    }

    #[test]
    fn test_glob_bad_pattern() {
        let err = glob_matches("/var/log/[").unwrap_err();
        assert!(matches!(err, Error::Glob(_)));
    }

    #[test]
    fn test_is_stale() {
        let day = Duration::from_secs(24 * 3600);
        assert!(!is_stale(SystemTime::now(), day));
        assert!(is_stale(SystemTime::now() - 2 * day, day));
    }

    #[tokio::test]
    async fn test_real_path_of_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(real_path(dir.path().join("nope.log")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_path_resolves_symlinks() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.log");
        let link = dir.path().join("link.log");
        fs::write(&target, "x\n").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let (real, meta) = real_path(&link).await.unwrap();
        assert_eq!(real, fs::canonicalize(&target).unwrap());
        assert!(meta.is_file());

        let (real_dir, meta) = real_path(dir.path()).await.unwrap();
        assert_eq!(real_dir, fs::canonicalize(dir.path()).unwrap());
        assert!(meta.is_dir());
    }
}
