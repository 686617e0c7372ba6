//! Durable checkpoints for manager state
//!
//! Each checkpoint is a JSON envelope holding the serialized payload and its
//! SHA-256 checksum. A checksum mismatch on load is reported as corruption,
//! never silently ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invalid checkpoint key '{0}'")]
    InvalidKey(String),

    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint '{key}' is corrupted: checksum {actual} does not match {expected}")]
    Corrupted {
        key: String,
        expected: String,
        actual: String,
    },
}

/// Key/value storage for checkpoint blobs.
pub trait CheckpointStore: Send + Sync {
    /// Returns `None` when no checkpoint exists under `key`.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError>;

    fn save(&self, key: &str, data: &[u8]) -> Result<(), CheckpointError>;

    fn remove(&self, key: &str) -> Result<(), CheckpointError>;
}

/// Stores each checkpoint as a file in a directory, replaced atomically.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CheckpointError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(CheckpointError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persist directory entries so a completed rename survives power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<(), CheckpointError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        // Write atomically using temp file
        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(io_err(&temp_path))?;
        file.write_all(data).map_err(io_err(&temp_path))?;
        file.sync_all().map_err(io_err(&temp_path))?;

        fs::rename(&temp_path, &path).map_err(io_err(&path))?;
        sync_dir(&self.dir).map_err(io_err(&self.dir))?;

        debug!(path = %path.display(), bytes = data.len(), "Checkpoint written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    data: String,
}

fn checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize `value` and store it under `key` with a checksum.
pub fn write_checkpoint<T: Serialize>(
    store: &dyn CheckpointStore,
    key: &str,
    value: &T,
) -> Result<(), CheckpointError> {
    let data = serde_json::to_string(value)?;
    let envelope = Envelope {
        checksum: checksum(&data),
        data,
    };
    store.save(key, &serde_json::to_vec_pretty(&envelope)?)
}

/// Load and verify the checkpoint under `key`.
///
/// Returns `Ok(None)` when nothing was ever written.
pub fn read_checkpoint<T: DeserializeOwned>(
    store: &dyn CheckpointStore,
    key: &str,
) -> Result<Option<T>, CheckpointError> {
    let Some(raw) = store.load(key)? else {
        return Ok(None);
    };

    let envelope: Envelope = serde_json::from_slice(&raw)?;
    let actual = checksum(&envelope.data);
    if actual != envelope.checksum {
        return Err(CheckpointError::Corrupted {
            key: key.to_string(),
            expected: envelope.checksum,
            actual,
        });
    }

    Ok(Some(serde_json::from_str(&envelope.data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("state"));
        let value = BTreeMap::from([("a".to_string(), 1u32), ("b".to_string(), 2)]);

        write_checkpoint(&store, "cpu_manager_state", &value).unwrap();
        let loaded: Option<BTreeMap<String, u32>> =
            read_checkpoint(&store, "cpu_manager_state").unwrap();

        assert_eq!(loaded, Some(value));
        assert!(!dir.path().join("state/cpu_manager_state.tmp").exists());
    }

    #[test]
    fn test_file_store_overwrite_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        store.save("device_manager_state", b"first").unwrap();
        store.save("device_manager_state", b"second").unwrap();

        assert_eq!(
            store.load("device_manager_state").unwrap().as_deref(),
            Some(&b"second"[..])
        );
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("device_manager_state")]);
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let store = MemoryCheckpointStore::new();
        let loaded: Option<u32> = read_checkpoint(&store, "nothing").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_tampered_checkpoint_is_corrupted() {
        let store = MemoryCheckpointStore::new();
        write_checkpoint(&store, "k", &vec![1, 2, 3]).unwrap();

        let raw = String::from_utf8(store.load("k").unwrap().unwrap()).unwrap();
        let tampered = raw.replace("[1,2,3]", "[1,2,4]");
        store.save("k", tampered.as_bytes()).unwrap();

        let err = read_checkpoint::<Vec<u32>>(&store, "k").unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted { .. }));
    }

    #[test]
    fn test_garbage_checkpoint_is_error() {
        let store = MemoryCheckpointStore::new();
        store.save("k", b"not json").unwrap();
        assert!(matches!(
            read_checkpoint::<u32>(&store, "k"),
            Err(CheckpointError::Serialization(_))
        ));
    }

    #[test]
    fn test_file_store_remove_and_invalid_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        store.save("k", b"x").unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert!(store.load("k").unwrap().is_none());

        assert!(matches!(store.save("../k", b"x"), Err(CheckpointError::InvalidKey(_))));
        assert!(matches!(store.load(""), Err(CheckpointError::InvalidKey(_))));
    }
}
