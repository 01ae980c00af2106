//! Durable progress for a watch.
//!
//! An [`OffsetStore`] holds two things per watch: one opaque buffer owned by
//! the watch itself (the serialized pending-line cache), and one offset
//! ("submeta") per tracked file owned by that file's line source.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Storage backing a watch's resumable state.
///
/// Implementations are shared between the watcher and every tailer, so all
/// methods take `&self`.
pub trait OffsetStore: Send + Sync + Debug {
    /// Returns the watch buffer, or `None` if nothing was written yet.
    fn read_buf(&self) -> Result<Option<Vec<u8>>>;

    /// Replaces the watch buffer as a whole.
    fn write_buf(&self, buf: &[u8]) -> Result<()>;

    /// Registers `identity` as tracked by the watch.
    fn add_sub_meta(&self, identity: &Path) -> Result<()>;

    /// Forgets `identity` along with its saved offset.
    fn remove_sub_meta(&self, identity: &Path) -> Result<()>;

    fn read_offset(&self, identity: &Path) -> Result<Option<u64>>;

    fn write_offset(&self, identity: &Path, offset: u64) -> Result<()>;

    /// Drops the saved offset of `identity`, keeping its registration.
    fn reset_offset(&self, identity: &Path) -> Result<()>;

    /// Drops the watch buffer.
    fn reset(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SubMeta {
    path: PathBuf,
    offset: u64,
}

/// Directory-backed store.
///
/// Layout: `<dir>/buf.json` for the watch buffer, and
/// `<dir>/sub/<identity>.json` per file, where path separators in the
/// identity are replaced by `_`. Every write lands in a temp file that is
/// then renamed into place.
///
/// A file is registered by its submeta file, which the first offset write
/// creates; registering ahead of that keeps nothing on disk, so a file whose
/// offset was never synced resumes from its start position.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Opens the store rooted at `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("sub")).map_err(|e| {
            Error::Persistence(format!("failed to create {}: {}", dir.display(), e))
        })?;

        Ok(JsonFileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn buf_path(&self) -> PathBuf {
        self.dir.join("buf.json")
    }

    fn sub_meta_path(&self, identity: &Path) -> PathBuf {
        let name = identity
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "_");
        self.dir.join("sub").join(format!("{}.json", name))
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Writes `contents` to `path` through a uniquely named temp file.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    fs::write(&temp_path, contents).map_err(|e| {
        Error::Persistence(format!("failed to write {}: {}", temp_path.display(), e))
    })?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Persistence(format!("failed to rename into {}: {}", path.display(), e))
    })
}

impl OffsetStore for JsonFileStore {
    fn read_buf(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(self.buf_path()) {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_buf(&self, buf: &[u8]) -> Result<()> {
        atomic_write(&self.buf_path(), buf)
    }

    fn add_sub_meta(&self, _identity: &Path) -> Result<()> {
        Ok(())
    }

    fn remove_sub_meta(&self, identity: &Path) -> Result<()> {
        remove_if_exists(&self.sub_meta_path(identity)).map_err(Error::from)
    }

    fn read_offset(&self, identity: &Path) -> Result<Option<u64>> {
        let buf = match fs::read(self.sub_meta_path(identity)) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: SubMeta = serde_json::from_slice(&buf)?;

        Ok(Some(meta.offset))
    }

    fn write_offset(&self, identity: &Path, offset: u64) -> Result<()> {
        let meta = SubMeta {
            path: identity.to_path_buf(),
            offset,
        };
        atomic_write(&self.sub_meta_path(identity), &serde_json::to_vec(&meta)?)
    }

    fn reset_offset(&self, identity: &Path) -> Result<()> {
        remove_if_exists(&self.sub_meta_path(identity)).map_err(Error::from)
    }

    fn reset(&self) -> Result<()> {
        remove_if_exists(&self.buf_path()).map_err(Error::from)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    buf: Option<Vec<u8>>,
    offsets: HashMap<PathBuf, u64>,
    registered: HashSet<PathBuf>,
}

/// Store that keeps everything in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities currently registered through `add_sub_meta`.
    pub fn registered(&self) -> Vec<PathBuf> {
        self.state.lock().registered.iter().cloned().collect()
    }
}

impl OffsetStore for MemoryStore {
    fn read_buf(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().buf.clone())
    }

    fn write_buf(&self, buf: &[u8]) -> Result<()> {
        self.state.lock().buf = Some(buf.to_vec());
        Ok(())
    }

    fn add_sub_meta(&self, identity: &Path) -> Result<()> {
        self.state.lock().registered.insert(identity.to_path_buf());
        Ok(())
    }

    fn remove_sub_meta(&self, identity: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.registered.remove(identity);
        state.offsets.remove(identity);
        Ok(())
    }

    fn read_offset(&self, identity: &Path) -> Result<Option<u64>> {
        Ok(self.state.lock().offsets.get(identity).copied())
    }

    fn write_offset(&self, identity: &Path, offset: u64) -> Result<()> {
        self.state
            .lock()
            .offsets
            .insert(identity.to_path_buf(), offset);
        Ok(())
    }

    fn reset_offset(&self, identity: &Path) -> Result<()> {
        self.state.lock().offsets.remove(identity);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.state.lock().buf = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_store_buf() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("meta")).unwrap();

        assert!(store.read_buf().unwrap().is_none());
        store.write_buf(b"{\"a\":\"b\"}").unwrap();
        assert_eq!(store.read_buf().unwrap().unwrap(), b"{\"a\":\"b\"}");

        // Another handle on the same directory sees the same buffer
        let reopened = JsonFileStore::open(dir.path().join("meta")).unwrap();
        assert_eq!(reopened.read_buf().unwrap().unwrap(), b"{\"a\":\"b\"}");

        store.reset().unwrap();
        assert!(store.read_buf().unwrap().is_none());
        // Resetting twice is fine
        store.reset().unwrap();
    }

    #[test]
    fn test_json_store_offsets() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let identity = Path::new("/var/log/app.log");

        assert_eq!(store.read_offset(identity).unwrap(), None);
        store.add_sub_meta(identity).unwrap();
        store.write_offset(identity, 42).unwrap();
        assert_eq!(store.read_offset(identity).unwrap(), Some(42));

        let file_name = store
            .sub_meta_path(identity)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(!file_name.contains(std::path::MAIN_SEPARATOR));

        store.reset_offset(identity).unwrap();
        assert_eq!(store.read_offset(identity).unwrap(), None);

        store.write_offset(identity, 7).unwrap();
        assert!(store.sub_meta_path(identity).exists());
        store.remove_sub_meta(identity).unwrap();
        assert_eq!(store.read_offset(identity).unwrap(), None);
        assert!(!store.sub_meta_path(identity).exists());
    }

    #[test]
    fn test_json_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        for i in 0..5 {
            store.write_buf(format!("{}", i).as_bytes()).unwrap();
        }

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let identity = Path::new("/tmp/a.log");

        store.add_sub_meta(identity).unwrap();
        store.write_offset(identity, 3).unwrap();
        assert_eq!(store.registered(), vec![identity.to_path_buf()]);
        assert_eq!(store.read_offset(identity).unwrap(), Some(3));

        store.remove_sub_meta(identity).unwrap();
        assert!(store.registered().is_empty());
        assert_eq!(store.read_offset(identity).unwrap(), None);
    }
}
