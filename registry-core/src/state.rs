//! The replicated registry state: a key-value map and a services map, each
//! behind its own lock per the documented lock order (`KV` before
//! `Services`). `RegistryState` is the single concrete type; the capability
//! traits in this module (`KvStore`, `ServiceRegistry`, `CleanableResource`)
//! let callers depend on only the surface they use.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub host: String,
    pub port: u16,
    /// Unix milliseconds; set once, on first registration, and preserved
    /// across renewals.
    pub created_unix_ms: i64,
    pub last_beat_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceEntry {
    pub name: String,
    pub instances: Vec<InstanceEntry>,
}

/// A resource accessible by the cleanup loop: the set of services and their
/// instances, read without mutating through the lock.
pub trait CleanableResource {
    fn get_resources(&self) -> HashMap<String, ServiceEntry>;
}

pub trait KvStore {
    fn put(&self, key: String, value: String);
    fn delete(&self, key: &str);
    fn get(&self, key: &str) -> Option<String>;
}

pub trait ServiceRegistry {
    /// Upsert an instance: a matching `(host, port)` renews in place and
    /// keeps its original `created_unix_ms`; otherwise this is a fresh
    /// registration. Returns the stored entry either way.
    fn register(&self, service: &str, instance: InstanceEntry) -> InstanceEntry;
    fn delete_instance(&self, service: &str, host: &str, port: u16);
    fn get_services(&self) -> Vec<ServiceEntry>;
}

/// The replicated registry state. Owned exclusively by the FSM applier;
/// every other component reaches it through the traits above or through a
/// read-only snapshot.
#[derive(Debug, Default)]
pub struct RegistryState {
    kv: RwLock<HashMap<String, String>>,
    services: RwLock<HashMap<String, ServiceEntry>>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consistent copy of both maps, for snapshotting. Takes `kv` before
    /// `services`, per the documented lock order.
    pub fn snapshot_maps(&self) -> (HashMap<String, String>, HashMap<String, ServiceEntry>) {
        let kv = self.kv.read();
        let services = self.services.read();
        (kv.clone(), services.clone())
    }

    /// Replace both maps wholesale. Used by restore.
    pub fn replace_maps(&self, kv: HashMap<String, String>, services: HashMap<String, ServiceEntry>) {
        *self.kv.write() = kv;
        *self.services.write() = services;
    }
}

impl KvStore for RegistryState {
    fn put(&self, key: String, value: String) {
        self.kv.write().insert(key, value);
    }

    fn delete(&self, key: &str) {
        self.kv.write().remove(key);
    }

    fn get(&self, key: &str) -> Option<String> {
        self.kv.read().get(key).cloned()
    }
}

impl ServiceRegistry for RegistryState {
    fn register(&self, service: &str, instance: InstanceEntry) -> InstanceEntry {
        let mut services = self.services.write();
        let entry = services.entry(service.to_string()).or_insert_with(|| ServiceEntry {
            name: service.to_string(),
            instances: Vec::new(),
        });

        if let Some(existing) = entry
            .instances
            .iter_mut()
            .find(|i| i.host == instance.host && i.port == instance.port)
        {
            existing.last_beat_ms = instance.last_beat_ms;
            existing.clone()
        } else {
            entry.instances.push(instance.clone());
            instance
        }
    }

    fn delete_instance(&self, service: &str, host: &str, port: u16) {
        let mut services = self.services.write();
        if let Some(entry) = services.get_mut(service) {
            entry.instances.retain(|i| !(i.host == host && i.port == port));
        }
    }

    fn get_services(&self) -> Vec<ServiceEntry> {
        self.services.read().values().cloned().collect()
    }
}

impl CleanableResource for RegistryState {
    fn get_resources(&self) -> HashMap<String, ServiceEntry> {
        // Shallow copy of the outer mapping: cloning `ServiceEntry` here is
        // the "snapshot view" the cleanup loop scans without holding the
        // services lock for the duration of its (potentially slow) propose
        // calls.
        self.services.read().clone()
    }
}
