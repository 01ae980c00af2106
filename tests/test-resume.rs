use globtail::{JsonFileStore, Line, OffsetStore, PatternWatcher, WatchConfig};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time;

fn watcher(log_dir: &Path, meta_dir: &Path) -> PatternWatcher {
    let config = WatchConfig::new(format!("{}/*.log", log_dir.display()))
        .with_stat_interval(Duration::from_secs(3600))
        .with_runner_name("test-resume");
    let store = Arc::new(JsonFileStore::open(meta_dir).unwrap());

    PatternWatcher::new(config, store).unwrap()
}

async fn next_line(watcher: &mut PatternWatcher) -> Line {
    time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(line) = watcher.read_line().await.unwrap() {
                return line;
            }
        }
    })
    .await
    .unwrap()
}

async fn drain(watcher: &mut PatternWatcher) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = watcher.read_line().await.unwrap() {
        lines.push(line.into_inner().1);
    }
    lines
}

/// Pending lines saved in the watch buffer under `meta_dir`.
fn cached_lines(meta_dir: &Path) -> Vec<String> {
    let buf = JsonFileStore::open(meta_dir)
        .unwrap()
        .read_buf()
        .unwrap()
        .unwrap_or_default();
    if buf.is_empty() {
        return Vec::new();
    }
    let cache: HashMap<String, String> = serde_json::from_slice(&buf).unwrap();
    cache.into_values().collect()
}

#[tokio::test(flavor = "multi_thread")]
pub async fn test_resume_after_crash() {
    let logs = tempdir().unwrap();
    let meta = tempdir().unwrap();
    fs::write(logs.path().join("app.log"), "one\ntwo\nthree\n").unwrap();

    let mut first = watcher(logs.path(), meta.path());
    assert_eq!(next_line(&mut first).await.line(), "one");

    // "two" was handed to the channel but never returned, so it is saved as
    // pending even though the offset is already past it
    time::timeout(Duration::from_secs(3), async {
        loop {
            first.sync_meta().await;
            if cached_lines(meta.path()) == vec!["two"] {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    drop(first);

    let mut second = watcher(logs.path(), meta.path());
    assert_eq!(drain(&mut second).await, vec!["two", "three"]);
    second.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
pub async fn test_resume_after_close() {
    let logs = tempdir().unwrap();
    let meta = tempdir().unwrap();
    fs::write(logs.path().join("app.log"), "one\ntwo\nthree\n").unwrap();

    let mut first = watcher(logs.path(), meta.path());
    assert_eq!(next_line(&mut first).await.line(), "one");

    // "two" read and offered, "three" still in the file
    time::timeout(Duration::from_secs(3), async {
        while first.lag().await.size != 6 {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    first.close().await.unwrap();
    // The offered copy of "two" went back with its tailer
    assert!(drain(&mut first).await.is_empty());
    assert_eq!(cached_lines(meta.path()), vec!["two"]);

    let mut second = watcher(logs.path(), meta.path());
    assert_eq!(drain(&mut second).await, vec!["two", "three"]);
    second.close().await.unwrap();
    assert!(cached_lines(meta.path()).is_empty());

    // Everything was delivered by the second watch
    let mut third = watcher(logs.path(), meta.path());
    assert!(drain(&mut third).await.is_empty());
    third.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
pub async fn test_corrupt_buffer_is_ignored() {
    let logs = tempdir().unwrap();
    let meta = tempdir().unwrap();
    fs::write(logs.path().join("app.log"), "only\n").unwrap();
    JsonFileStore::open(meta.path())
        .unwrap()
        .write_buf(b"{not json")
        .unwrap();

    let mut watcher = watcher(logs.path(), meta.path());
    assert_eq!(drain(&mut watcher).await, vec!["only"]);
    watcher.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
pub async fn test_reset_forgets_progress() {
    let logs = tempdir().unwrap();
    let meta = tempdir().unwrap();
    let path = logs.path().join("app.log");
    fs::write(&path, "a\nb\n").unwrap();

    let mut first = watcher(logs.path(), meta.path());
    assert_eq!(drain(&mut first).await, vec!["a", "b"]);
    first.sync_meta().await;

    let store = JsonFileStore::open(meta.path()).unwrap();
    let identity = fs::canonicalize(&path).unwrap();
    assert_eq!(store.read_offset(&identity).unwrap(), Some(4));

    first.reset().await.unwrap();
    assert!(store.read_buf().unwrap().is_none());
    assert_eq!(store.read_offset(&identity).unwrap(), None);
    // Gone without a final sync
    drop(first);

    let mut second = watcher(logs.path(), meta.path());
    assert_eq!(drain(&mut second).await, vec!["a", "b"]);
    second.close().await.unwrap();
}
