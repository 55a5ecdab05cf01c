use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::{EngineError, Result};

/// A stable per-install identifier. Wraps a `String` so it derives `Ord`, which the
/// resolver's deterministic tiebreak (spec.md §4.7 Tier 3) relies on directly:
/// lexicographically-lower `DeviceId` wins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persists the device identity somewhere independent of the entity store, so a
/// destructive wipe of local data does not regenerate it mid-session (spec.md §4.2).
pub trait DeviceIdentityStore: Send + Sync {
    fn get_or_create(&self) -> Result<DeviceId>;
}

/// Stores the device id in a plain text file next to, but outside of, the SQLite
/// database file. Read-only after first write.
pub struct FileDeviceIdentityStore {
    path: PathBuf,
    cached: Mutex<Option<DeviceId>>,
}

impl FileDeviceIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cached: Mutex::new(None) }
    }
}

impl DeviceIdentityStore for FileDeviceIdentityStore {
    fn get_or_create(&self) -> Result<DeviceId> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        if let Ok(existing) = fs::read_to_string(&self.path) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                let id = DeviceId(trimmed.to_string());
                *cached = Some(id.clone());
                return Ok(id);
            }
        }

        let id = DeviceId::generate();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|_| {
                EngineError::State("could not create device identity directory")
            })?;
        }
        fs::write(&self.path, id.as_str())
            .map_err(|_| EngineError::State("could not persist device identity"))?;
        *cached = Some(id.clone());
        Ok(id)
    }
}

/// In-memory identity store for tests and for hosts that don't need cross-restart
/// persistence (e.g. short-lived test fixtures).
pub struct MemoryDeviceIdentityStore {
    id: Mutex<Option<DeviceId>>,
}

impl Default for MemoryDeviceIdentityStore {
    fn default() -> Self {
        Self { id: Mutex::new(None) }
    }
}

impl DeviceIdentityStore for MemoryDeviceIdentityStore {
    fn get_or_create(&self) -> Result<DeviceId> {
        let mut guard = self.id.lock().unwrap();
        if guard.is_none() {
            *guard = Some(DeviceId::generate());
        }
        Ok(guard.as_ref().unwrap().clone())
    }
}
