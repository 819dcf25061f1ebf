//! Persistent key/value store shared by every instance of the installation.
//!
//! Reads and writes are single-key operations with no transactions. Another
//! process may change a key between a read and a write; callers treat the
//! store as an eventually consistent register.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::warn;

use crate::errors::BootstrapError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<Value>, BootstrapError>;

    /// Atomically set a single key.
    async fn set_value(&self, key: &str, value: Value) -> Result<(), BootstrapError>;
}

impl dyn KeyValueStore {
    /// Typed read; a missing, unreadable or mistyped value yields `default`.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get_value(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(typed) => typed,
                Err(e) => {
                    warn!(key, "stored value has unexpected shape: {}", e);
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                warn!(key, "failed to read store: {}", e);
                default
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), BootstrapError> {
        let value = serde_json::to_value(value)
            .map_err(|e| BootstrapError::Store(format!("cannot encode '{key}': {e}")))?;
        self.set_value(key, value).await
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_value(&self, key: &str) -> Result<Option<Value>, BootstrapError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<(), BootstrapError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON object on disk.
///
/// Every read goes to the file so writes from other processes are seen. A
/// write holds an exclusive lock on `<file>.lock` across read, insert and
/// replace, so concurrent writers of different keys never drop each other.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/cdp-bootstrap/state.json`, falling back to the temp dir.
    pub fn default_location() -> Self {
        let dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cdp-bootstrap");
        Self::new(dir.join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(path: &Path) -> Result<Map<String, Value>, BootstrapError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(BootstrapError::from_io(format!("reading {}", path.display()), e)),
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "store file is not a JSON object, starting fresh");
                Ok(Map::new())
            }
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn write_document(path: &Path, document: &Map<String, Value>) -> Result<(), BootstrapError> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)
            .map_err(|e| BootstrapError::from_io(format!("creating {}", dir.display()), e))?;

        let encoded = serde_json::to_vec_pretty(document)
            .map_err(|e| BootstrapError::Store(format!("cannot encode store: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| BootstrapError::from_io("creating temp store file", e))?;
        tmp.write_all(&encoded)
            .map_err(|e| BootstrapError::from_io("writing temp store file", e))?;
        tmp.persist(path)
            .map_err(|e| BootstrapError::from_io(format!("replacing {}", path.display()), e.error))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get_value(&self, key: &str) -> Result<Option<Value>, BootstrapError> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Value>, BootstrapError> {
            Ok(Self::read_document(&path)?.get(&key).cloned())
        })
        .await
        .map_err(|e| BootstrapError::Internal(format!("store task failed: {e}")))?
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<(), BootstrapError> {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), BootstrapError> {
            if let Some(dir) = lock_path.parent() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| BootstrapError::from_io(format!("creating {}", dir.display()), e))?;
            }
            let lock_file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| BootstrapError::from_io(format!("opening {}", lock_path.display()), e))?;
            FileExt::lock_exclusive(&lock_file)
                .map_err(|e| BootstrapError::from_io(format!("locking {}", lock_path.display()), e))?;

            let mut document = Self::read_document(&path)?;
            document.insert(key, value);
            let written = Self::write_document(&path, &document);
            drop(lock_file);
            written
        })
        .await
        .map_err(|e| BootstrapError::Internal(format!("store task failed: {e}")))?
    }
}
