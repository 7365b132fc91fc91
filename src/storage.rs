//! Keyed context storage.
//!
//! A context is a named directory holding `persist.json`, a flat JSON object
//! map. Contexts back the bridge settings, the plugin list and the per
//! server node engine state (endpoint numbers, fabrics). Every mutation is
//! flushed with write-to-temp plus atomic rename, so writes are durable
//! before `close` returns.

use crate::error::{BridgeError, Result};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PERSIST_FILE: &str = "persist.json";

/// Opens and caches named storage contexts under a single root directory.
pub struct StorageManager {
    root: PathBuf,
    contexts: Mutex<HashMap<String, Arc<StorageContext>>>,
}

impl StorageManager {
    /// Open the manager rooted at `root`, creating the directory and probing
    /// it for writability.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| BridgeError::StorageUnavailable(format!("{}: {e}", root.display())))?;

        // Probe: a root we cannot write to is unusable, fail at init.
        let probe = root.join(".probe");
        fs::write(&probe, b"ok")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| BridgeError::StorageUnavailable(format!("{}: {e}", root.display())))?;

        Ok(Self {
            root,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open (or return the already-open) context with the given name.
    pub fn context(&self, name: &str) -> Result<Arc<StorageContext>> {
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(name) {
            return Ok(ctx.clone());
        }
        let ctx = Arc::new(StorageContext::open(&self.root, name)?);
        contexts.insert(name.to_string(), ctx.clone());
        Ok(ctx)
    }

    /// Names of all contexts present on disk.
    pub fn context_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir()
                    && let Some(name) = path.file_name().and_then(|n| n.to_str())
                    && !name.ends_with(".backup")
                {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names
    }

    /// Duplicate a context directory to `<name>.backup` atomically: the copy
    /// lands in a staging directory first, then renames over the backup.
    /// Failures are logged and non-fatal.
    pub fn backup(&self, name: &str) -> Option<PathBuf> {
        let source = self.root.join(name);
        if !source.is_dir() {
            warn!("[Storage] No context {name} to back up");
            return None;
        }
        let staging = self.root.join(format!(".{name}.backup.tmp"));
        let target = self.root.join(format!("{name}.backup"));

        let result = (|| -> std::io::Result<()> {
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            fs::create_dir_all(&staging)?;
            for entry in fs::read_dir(&source)? {
                let entry = entry?;
                fs::copy(entry.path(), staging.join(entry.file_name()))?;
            }
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            fs::rename(&staging, &target)
        })();

        match result {
            Ok(()) => {
                info!("[Storage] Backed up context {name} to {}", target.display());
                Some(target)
            }
            Err(e) => {
                warn!("[Storage] Backup of context {name} failed: {e}");
                let _ = fs::remove_dir_all(&staging);
                None
            }
        }
    }

    /// Flush all open contexts and drop the handles.
    pub fn close(&self) -> Result<()> {
        let mut contexts = self.contexts.lock();
        for (name, ctx) in contexts.drain() {
            if let Err(e) = ctx.flush() {
                warn!("[Storage] Flush of context {name} on close failed: {e}");
            }
        }
        Ok(())
    }
}

/// A single named context: a flat key/value map persisted as JSON.
pub struct StorageContext {
    name: String,
    dir: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl StorageContext {
    fn open(root: &Path, name: &str) -> Result<Self> {
        let dir = root.join(name);
        fs::create_dir_all(&dir)
            .map_err(|e| BridgeError::StorageUnavailable(format!("{}: {e}", dir.display())))?;

        let file = dir.join(PERSIST_FILE);
        let values = if file.exists() {
            match fs::read_to_string(&file) {
                Ok(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                    Ok(map) => map,
                    Err(e) => {
                        // A corrupt persist file must not brick startup.
                        warn!("[Storage] Context {name} is corrupt ({e}), starting fresh");
                        Map::new()
                    }
                },
                Err(e) => {
                    warn!("[Storage] Failed to read context {name}: {e}");
                    Map::new()
                }
            }
        } else {
            Map::new()
        };

        Ok(Self {
            name: name.to_string(),
            dir,
            values: Mutex::new(values),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a typed value; `None` when absent or of an unexpected shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.lock();
        values
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Read a typed value, falling back to `default` when absent.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Store a value and flush it to disk before returning.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_value(value)?;
        let snapshot = {
            let mut values = self.values.lock();
            values.insert(key.to_string(), json);
            values.clone()
        };
        self.write(&snapshot)
    }

    /// Remove a key; flushes when the key existed.
    pub fn remove(&self, key: &str) -> Result<()> {
        let snapshot = {
            let mut values = self.values.lock();
            if values.remove(key).is_none() {
                return Ok(());
            }
            values.clone()
        };
        self.write(&snapshot)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }

    /// Rewrite the persist file from the in-memory map.
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.values.lock().clone();
        self.write(&snapshot)
    }

    fn write(&self, values: &Map<String, Value>) -> Result<()> {
        let tmp = self.dir.join(format!(".{PERSIST_FILE}.tmp"));
        let file = self.dir.join(PERSIST_FILE);
        let text = serde_json::to_string_pretty(values)?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_close_reopen_get() {
        let dir = TempDir::new().unwrap();

        let manager = StorageManager::open(dir.path()).unwrap();
        let ctx = manager.context("matterbridge").unwrap();
        ctx.set("password", &"hunter2".to_string()).unwrap();
        ctx.set("port", &5540u16).unwrap();
        manager.close().unwrap();

        let manager = StorageManager::open(dir.path()).unwrap();
        let ctx = manager.context("matterbridge").unwrap();
        assert_eq!(ctx.get::<String>("password").as_deref(), Some("hunter2"));
        assert_eq!(ctx.get::<u16>("port"), Some(5540));
    }

    #[test]
    fn test_same_name_returns_same_context() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(dir.path()).unwrap();
        let a = manager.context("plugin1").unwrap();
        let b = manager.context("plugin1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unwritable_root_is_storage_unavailable() {
        let result = StorageManager::open("/proc/no-such-storage-root");
        assert!(matches!(result, Err(BridgeError::StorageUnavailable(_))));
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(dir.path()).unwrap();
        let ctx = manager.context("matterbridge").unwrap();
        ctx.remove("absent").unwrap();
    }

    #[test]
    fn test_backup_duplicates_context() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(dir.path()).unwrap();
        let ctx = manager.context("Matterbridge").unwrap();
        ctx.set("storeId", &"Matterbridge".to_string()).unwrap();

        let backup = manager.backup("Matterbridge").unwrap();
        assert!(backup.join(PERSIST_FILE).exists());

        // Backup is a copy: later writes do not affect it
        ctx.set("storeId", &"changed".to_string()).unwrap();
        let text = fs::read_to_string(backup.join(PERSIST_FILE)).unwrap();
        assert!(text.contains("Matterbridge"));
    }

    #[test]
    fn test_backup_of_missing_context_is_nonfatal() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(dir.path()).unwrap();
        assert!(manager.backup("ghost").is_none());
    }

    #[test]
    fn test_corrupt_persist_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let ctx_dir = dir.path().join("broken");
        fs::create_dir_all(&ctx_dir).unwrap();
        fs::write(ctx_dir.join(PERSIST_FILE), b"{not json").unwrap();

        let manager = StorageManager::open(dir.path()).unwrap();
        let ctx = manager.context("broken").unwrap();
        assert!(ctx.keys().is_empty());
    }
}
