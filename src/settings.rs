use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use tracing::{debug, info};

use crate::error::{DemagError, Result};

/// Key under which the last selected device address is stored
pub const LAST_DEVICE_KEY: &str = "device_id";

/// String key/value persistence
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Volatile store, mostly for tests and one-shot tools
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store backed by a pretty-printed JSON object on disk
///
/// The whole file is rewritten on every `set`.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open the store, starting empty if the file does not exist yet
    ///
    /// # Errors
    ///
    /// Returns [`DemagError::Settings`] if the file exists but is not a JSON
    /// object of strings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                DemagError::Settings(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Location of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(&*values)?)?;
        Ok(())
    }
}

/// Typed view of the persisted settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Address of the last selected device
    pub last_device: Option<String>,
}

impl Settings {
    /// Load from a store
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn load(store: &dyn KeyValueStore) -> Result<Self> {
        Ok(Self {
            last_device: load_last_device(store)?,
        })
    }

    /// Write back to a store
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        if let Some(address) = &self.last_device {
            save_last_device(store, address)?;
        }
        Ok(())
    }
}

/// Address of the last selected device
///
/// # Errors
///
/// Returns store errors.
pub fn load_last_device(store: &dyn KeyValueStore) -> Result<Option<String>> {
    Ok(store.get(LAST_DEVICE_KEY)?.filter(|address| !address.is_empty()))
}

/// Remember the selected device
///
/// # Errors
///
/// Returns store errors.
pub fn save_last_device(store: &dyn KeyValueStore, address: &str) -> Result<()> {
    info!("Remembering device {address}");
    store.set(LAST_DEVICE_KEY, address)
}
