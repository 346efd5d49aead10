//! Entry point to the distributed primitives.
//!
//! A `DataProvider` binds one node (scheduler or agent) to a backing store
//! and hands out typed views of the named structures. Two providers over the
//! same backend see the same data; each owns its own listeners.

use std::sync::Arc;
use std::time::Duration;

use super::backend::StoreBackend;
use super::listeners::ListenerHub;
use super::map::DistributedMap;
use super::memory::MemoryStore;
use super::queue::DistributedQueue;
use super::remote::RemoteStore;
use super::topic::DistributedTopic;
use super::types::{MapKey, StoreValue};
use crate::config::{BackendKind, StoreConfig};

pub struct DataProvider {
    backend: Arc<dyn StoreBackend>,
    hub: Arc<ListenerHub>,
    member: String,
    lock_timeout: Duration,
    lock_lease: Duration,
}

impl DataProvider {
    pub fn new(backend: Arc<dyn StoreBackend>, member: &str, config: &StoreConfig) -> Self {
        Self {
            hub: ListenerHub::new(backend.clone()),
            backend,
            member: member.to_string(),
            lock_timeout: config.lock_timeout,
            lock_lease: config.lock_lease,
        }
    }

    /// Builds the backend named by `config.backend`.
    ///
    /// `Memory` creates a fresh private store; components that must share an
    /// in-process store should build it once and use `new`.
    pub fn from_config(member: &str, config: &StoreConfig) -> Self {
        let backend: Arc<dyn StoreBackend> = match &config.backend {
            BackendKind::Memory => Arc::new(MemoryStore::with_event_capacity(config.event_capacity)),
            BackendKind::Remote { url } => Arc::new(RemoteStore::new(url, config.request_timeout)),
        };
        tracing::info!(
            "Data provider for {} using {:?} backend",
            member,
            config.backend
        );
        Self::new(backend, member, config)
    }

    pub fn backend(&self) -> Arc<dyn StoreBackend> {
        self.backend.clone()
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn get_queue<T: StoreValue>(&self, name: &str) -> DistributedQueue<T> {
        DistributedQueue::new(name, self.backend.clone(), self.hub.clone())
    }

    pub fn get_map<K: MapKey, V: StoreValue>(&self, name: &str) -> DistributedMap<K, V> {
        DistributedMap::new(
            name,
            self.backend.clone(),
            self.hub.clone(),
            &self.member,
            self.lock_timeout,
            self.lock_lease,
        )
    }

    pub fn get_topic<T: StoreValue>(&self, name: &str) -> DistributedTopic<T> {
        DistributedTopic::new(name, self.backend.clone(), self.hub.clone())
    }

    /// Stops every listener registered through this provider.
    pub fn remove_all_listeners(&self) {
        self.hub.unsubscribe_all();
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }
}
