//! Key-value storage behind the session store and the shared mailbox.
//!
//! The pairing protocol only needs `get/set/remove` on string values, so the
//! backing store is injected:
//!
//! - [`MemoryStore`]: process-local map. Plays the per-tab session store and
//!   the test double.
//! - [`FileStore`]: one JSON file per key in a directory. Scoped per
//!   [`Origin`] so that, like browser storage, two origins never see each
//!   other's mailbox.
//!
//! Paths are centralised in [`StorageConfig`] so tests can inject temp roots.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs_err as fs;
use tempfile::NamedTempFile;

use crate::error::{PairingError, Result};
use crate::origin::Origin;

pub const HOME_ENV: &str = "VERIMEZK_HOME";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Paths
// ═══════════════════════════════════════════════════════════════════════════════

/// Central configuration for all on-disk pairing paths.
///
/// Production code uses `StorageConfig::default()` which points to `~/.verimezk/`
/// (or `$VERIMEZK_HOME`). Tests use `StorageConfig::with_root(temp_dir)`.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".verimezk")))
            .unwrap_or_else(|| std::env::temp_dir().join(".verimezk"));
        Self { root }
    }
}

impl StorageConfig {
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to config.json (pairing tunables).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Path to logs/ directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Directory holding one origin's shared storage.
    /// Example: ~/.verimezk/origins/https_10.0.0.5_3356/
    pub fn origin_dir(&self, origin: &Origin) -> PathBuf {
        self.root.join("origins").join(origin.as_key())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| PairingError::Poisoned("memory store"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PairingError::Poisoned("memory store"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PairingError::Poisoned("memory store"))?;
        entries.remove(key);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// File-backed
// ═══════════════════════════════════════════════════════════════════════════════

/// Directory of `<key>.json` files.
///
/// Writes go to a temp file in the same directory and are renamed into place,
/// so a reader polling from another process never sees a half-written mailbox.
/// There is no locking: concurrent writers can lose updates, which the relay
/// tolerates.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_origin(config: &StorageConfig, origin: &Origin) -> Self {
        Self::new(config.origin_dir(origin))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PairingError::storage(format!("read {}", key), err)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| PairingError::storage("create storage dir", e))?;

        let mut temp_file = NamedTempFile::new_in(&self.dir)
            .map_err(|e| PairingError::storage("create temp file", e))?;
        temp_file
            .write_all(value.as_bytes())
            .map_err(|e| PairingError::storage(format!("write {}", key), e))?;
        temp_file
            .flush()
            .map_err(|e| PairingError::storage(format!("flush {}", key), e))?;
        temp_file
            .persist(self.key_path(key))
            .map_err(|e| PairingError::storage(format!("persist {}", key), e.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PairingError::storage(format!("remove {}", key), err)),
        }
    }
}
