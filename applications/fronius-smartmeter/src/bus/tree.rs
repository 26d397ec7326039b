use super::{BusValue, ChangeCallback, PathSpec, ProcessBus, TextFormat};
use crate::error::BusError;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

/// A change notification for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathUpdate {
    pub path: String,
    pub value: BusValue,
    pub text: String,
}

struct Entry {
    value: BusValue,
    format: TextFormat,
    writable: bool,
    on_change: Option<ChangeCallback>,
}

impl Entry {
    fn update(&self, path: &str) -> PathUpdate {
        PathUpdate {
            path: path.to_string(),
            value: self.value.clone(),
            text: self.format.render(&self.value),
        }
    }
}

/// In-process object tree of one bus service.
pub struct ObjectTree {
    service: String,
    entries: RwLock<BTreeMap<String, Entry>>,
    updates: broadcast::Sender<PathUpdate>,
}

impl ObjectTree {
    pub fn new(service: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            service: service.into(),
            entries: RwLock::new(BTreeMap::new()),
            updates,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Register a path. Re-adding an existing path replaces it.
    pub fn add_path(&self, spec: PathSpec) {
        let entry = Entry {
            value: spec.initial,
            format: spec.format,
            writable: spec.writable,
            on_change: spec.on_change,
        };
        let update = entry.update(&spec.path);
        self.write().insert(spec.path, entry);
        let _ = self.updates.send(update);
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.read().get(path).map(|e| e.format.render(&e.value))
    }

    pub fn is_writable(&self, path: &str) -> bool {
        self.read().get(path).map(|e| e.writable).unwrap_or(false)
    }

    /// Every path with its current value, in path order.
    pub fn snapshot(&self) -> Vec<PathUpdate> {
        self.read()
            .iter()
            .map(|(path, entry)| entry.update(path))
            .collect()
    }

    /// Change notifications for every value that actually changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PathUpdate> {
        self.updates.subscribe()
    }

    /// A change request from an external writer.
    ///
    /// The path's callback runs without the tree lock held, so it may read
    /// the tree. The value is stored only when the callback accepts it.
    pub fn write_external(&self, path: &str, value: BusValue) -> Result<(), BusError> {
        let callback = {
            let entries = self.read();
            let entry = entries
                .get(path)
                .ok_or_else(|| BusError::UnknownPath(path.to_string()))?;
            if !entry.writable {
                return Err(BusError::NotWritable(path.to_string()));
            }
            entry.on_change.clone()
        };

        if let Some(cb) = callback {
            if !cb(path, &value) {
                debug!(path, %value, "external write refused");
                return Err(BusError::Refused(path.to_string()));
            }
        }
        self.set(path, value)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessBus for ObjectTree {
    fn set(&self, path: &str, value: BusValue) -> Result<(), BusError> {
        let update = {
            let mut entries = self.write();
            let entry = entries
                .get_mut(path)
                .ok_or_else(|| BusError::UnknownPath(path.to_string()))?;
            if entry.value == value {
                return Ok(());
            }
            entry.value = value;
            entry.update(path)
        };
        // No subscribers is fine: the tree is still the source of truth.
        let _ = self.updates.send(update);
        Ok(())
    }

    fn get(&self, path: &str) -> Option<BusValue> {
        self.read().get(path).map(|e| e.value.clone())
    }

    fn on_change(&self, path: &str, callback: ChangeCallback) -> Result<(), BusError> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| BusError::UnknownPath(path.to_string()))?;
        entry.on_change = Some(callback);
        Ok(())
    }
}
