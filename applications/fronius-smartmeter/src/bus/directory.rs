use super::BusValue;
use std::collections::BTreeMap;

/// Read-only view of the other services on the bus.
pub trait BusDirectory {
    /// Names of all services currently visible, sorted.
    fn service_names(&self) -> Vec<String>;
    fn read(&self, service: &str, path: &str) -> Option<BusValue>;
}

/// Point-in-time copy of a set of service entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusSnapshot {
    services: BTreeMap<String, BTreeMap<String, BusValue>>,
}

impl BusSnapshot {
    pub fn insert(&mut self, service: impl Into<String>, path: impl Into<String>, value: BusValue) {
        self.services
            .entry(service.into())
            .or_default()
            .insert(path.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl BusDirectory for BusSnapshot {
    fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    fn read(&self, service: &str, path: &str) -> Option<BusValue> {
        self.services.get(service)?.get(path).cloned()
    }
}
