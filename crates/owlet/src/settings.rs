//! Per-device settings persistence
//!
//! The controller remembers one thing per device: the last IP address a
//! network owlet was reached at (`cachedIP`), used when discovery comes up
//! empty.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{OwletError, OwletResult};

/// Key under which the last known host of a network owlet is stored
pub const CACHED_IP_KEY: &str = "cachedIP";

/// Key/value settings scoped by device id
pub trait SettingsStore: Send + Sync {
    fn get(&self, device_id: &str, key: &str) -> Option<String>;

    fn set(&self, device_id: &str, key: &str, value: &str) -> OwletResult<()>;

    /// Forget every setting of a device
    fn remove_device(&self, device_id: &str) -> OwletResult<()>;
}

/// In-memory store, lost on exit
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, device_id: &str, key: &str) -> Option<String> {
        self.values
            .read()
            .get(device_id)
            .and_then(|settings| settings.get(key))
            .cloned()
    }

    fn set(&self, device_id: &str, key: &str, value: &str) -> OwletResult<()> {
        self.values
            .write()
            .entry(device_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_device(&self, device_id: &str) -> OwletResult<()> {
        self.values.write().remove(device_id);
        Ok(())
    }
}

type SettingsMap = BTreeMap<String, BTreeMap<String, String>>;

/// JSON file store
///
/// The whole file is rewritten on every change through a temporary file in
/// the same directory and a rename, so a crash leaves either the old or the
/// new contents.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: RwLock<SettingsMap>,
}

impl JsonFileSettings {
    /// Open a store, starting empty if the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> OwletResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => SettingsMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                OwletError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsMap::new(),
            Err(e) => {
                return Err(OwletError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        debug!(path = %path.display(), devices = values.len(), "Loaded settings");
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &SettingsMap) -> OwletResult<()> {
        let storage_err =
            |e: std::io::Error| OwletError::Storage(format!("{}: {}", self.path.display(), e));

        let json = serde_json::to_vec_pretty(values)
            .map_err(|e| OwletError::Storage(e.to_string()))?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).map_err(storage_err)?;
        file.write_all(&json).map_err(storage_err)?;
        file.sync_all().map_err(storage_err)?;
        fs::rename(&tmp_path, &self.path).map_err(storage_err)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, device_id: &str, key: &str) -> Option<String> {
        self.values
            .read()
            .get(device_id)
            .and_then(|settings| settings.get(key))
            .cloned()
    }

    fn set(&self, device_id: &str, key: &str, value: &str) -> OwletResult<()> {
        let mut values = self.values.write();
        let previous = values
            .entry(device_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        if previous.as_deref() == Some(value) {
            return Ok(());
        }
        self.persist(&values)
    }

    fn remove_device(&self, device_id: &str) -> OwletResult<()> {
        let mut values = self.values.write();
        if values.remove(device_id).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}
