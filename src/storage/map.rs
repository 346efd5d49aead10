//! Typed key/value map shared by every node connected to the same store.
//!
//! ## Locking
//! `lock(key)` is exclusive and not re-entrant: a second `lock` on the same
//! key fails with `LockTimeout` once `lock_timeout` elapses, even from the
//! same node. Held locks expire after the configured lease so a crashed
//! holder cannot wedge a key forever.

use dashmap::DashMap;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::backend::StoreBackend;
use super::listeners::ListenerHub;
use super::queue::DistributedQueue;
use super::types::*;
use crate::error::{CoordinatorError, Result};

const LOCK_RETRY_START_MS: u64 = 10;
const LOCK_RETRY_MAX_MS: u64 = 200;

pub struct DistributedMap<K, V> {
    name: String,
    backend: Arc<dyn StoreBackend>,
    hub: Arc<ListenerHub>,
    member: String,
    lock_timeout: Duration,
    lock_lease: Duration,
    /// Lock tokens held through this handle (and its clones), by key.
    held_locks: Arc<DashMap<String, String>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for DistributedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            hub: self.hub.clone(),
            member: self.member.clone(),
            lock_timeout: self.lock_timeout,
            lock_lease: self.lock_lease,
            held_locks: self.held_locks.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: MapKey, V: StoreValue> DistributedMap<K, V> {
    pub(crate) fn new(
        name: &str,
        backend: Arc<dyn StoreBackend>,
        hub: Arc<ListenerHub>,
        member: &str,
        lock_timeout: Duration,
        lock_lease: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            backend,
            hub,
            member: member.to_string(),
            lock_timeout,
            lock_lease,
            held_locks: Arc::new(DashMap::new()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        decode_opt(self.backend.map_get(&self.name, &key.to_string()).await?)
    }

    /// Values for the requested keys that exist. Missing keys are omitted.
    pub async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        let raw_keys = keys.iter().map(ToString::to_string).collect();
        let entries = self.backend.map_get_all(&self.name, raw_keys).await?;

        let mut result = HashMap::with_capacity(entries.len());
        for (raw_key, json) in entries {
            if let Some(key) = K::from_key(&raw_key) {
                result.insert(key, serde_json::from_str(&json)?);
            }
        }
        Ok(result)
    }

    /// Stores `value`, returning the value it replaced.
    pub async fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        let json = serde_json::to_string(value)?;
        decode_opt(
            self.backend
                .map_put(&self.name, &key.to_string(), json)
                .await?,
        )
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        decode_opt(self.backend.map_remove(&self.name, &key.to_string()).await?)
    }

    /// Replaces the entry only if it still equals `expected`.
    ///
    /// `expected = None` requires the key to be absent; `replacement = None`
    /// removes the entry.
    pub async fn compare_and_set(
        &self,
        key: &K,
        expected: Option<&V>,
        replacement: Option<&V>,
    ) -> Result<bool> {
        let expected = expected.map(serde_json::to_string).transpose()?;
        let replacement = replacement.map(serde_json::to_string).transpose()?;
        self.backend
            .map_compare_and_set(&self.name, &key.to_string(), expected, replacement)
            .await
    }

    /// Removes the entry if it still equals `expected` and appends `item` to
    /// `queue`, as one store operation. Returns false (and changes nothing)
    /// if the entry moved on.
    pub async fn transfer_to_queue<T: StoreValue>(
        &self,
        key: &K,
        expected: &V,
        queue: &DistributedQueue<T>,
        item: &T,
    ) -> Result<bool> {
        let expected = serde_json::to_string(expected)?;
        let item = serde_json::to_string(item)?;
        self.backend
            .map_transfer_to_queue(&self.name, &key.to_string(), expected, queue.name(), item)
            .await
    }

    pub async fn values(&self) -> Result<Vec<V>> {
        self.backend
            .map_entries(&self.name)
            .await?
            .iter()
            .map(|(_, json)| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    pub async fn key_set(&self) -> Result<Vec<K>> {
        Ok(self
            .backend
            .map_entries(&self.name)
            .await?
            .iter()
            .filter_map(|(raw_key, _)| K::from_key(raw_key))
            .collect())
    }

    pub async fn entry_set(&self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::new();
        for (raw_key, json) in self.backend.map_entries(&self.name).await? {
            if let Some(key) = K::from_key(&raw_key) {
                entries.push((key, serde_json::from_str(&json)?));
            }
        }
        Ok(entries)
    }

    pub async fn size(&self) -> Result<usize> {
        self.backend.map_len(&self.name).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.map_clear(&self.name).await
    }

    /// Acquires the per-key lock, waiting at most `lock_timeout`.
    pub async fn lock(&self, key: &K) -> Result<()> {
        let raw_key = key.to_string();
        let token = format!("{}/{}", self.member, Uuid::new_v4());
        let started = Instant::now();
        let mut delay_ms = LOCK_RETRY_START_MS;

        loop {
            if self
                .backend
                .map_try_lock(&self.name, &raw_key, &token, self.lock_lease)
                .await?
            {
                self.held_locks.insert(raw_key, token);
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.lock_timeout {
                return Err(CoordinatorError::LockTimeout {
                    map: self.name.clone(),
                    key: raw_key,
                    waited,
                });
            }

            let remaining = self.lock_timeout - waited;
            tokio::time::sleep(Duration::from_millis(delay_ms).min(remaining)).await;
            delay_ms = (delay_ms * 2).min(LOCK_RETRY_MAX_MS);
        }
    }

    /// Non-blocking variant of `lock`.
    pub async fn try_lock(&self, key: &K) -> Result<bool> {
        let raw_key = key.to_string();
        let token = format!("{}/{}", self.member, Uuid::new_v4());
        let acquired = self
            .backend
            .map_try_lock(&self.name, &raw_key, &token, self.lock_lease)
            .await?;
        if acquired {
            self.held_locks.insert(raw_key, token);
        }
        Ok(acquired)
    }

    /// Releases a lock taken through this handle. Returns false if it was not
    /// held here or its lease already expired.
    pub async fn unlock(&self, key: &K) -> Result<bool> {
        let raw_key = key.to_string();
        let Some((_, token)) = self.held_locks.remove(&raw_key) else {
            return Ok(false);
        };

        let released = self.backend.map_unlock(&self.name, &raw_key, &token).await?;
        if !released {
            tracing::warn!(
                "Lock on {}/{} expired before it was released",
                self.name,
                raw_key
            );
        }
        Ok(released)
    }

    /// Invokes `listener` for every entry added, updated or removed after
    /// registration. Runs on a dedicated task, never inline with the map
    /// operation.
    pub async fn add_entry_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(EntryEvent<K, V>) + Send + Sync + 'static,
    {
        let map = self.name.clone();
        let handler = Arc::new(move |event: StoreEvent| {
            let (kind, raw_key, value, old_value) = match event {
                StoreEvent::EntryAdded { key, value } => {
                    (EntryEventKind::Added, key, Some(value), None)
                }
                StoreEvent::EntryUpdated {
                    key,
                    value,
                    old_value,
                } => (EntryEventKind::Updated, key, Some(value), Some(old_value)),
                StoreEvent::EntryRemoved { key, old_value } => {
                    (EntryEventKind::Removed, key, None, Some(old_value))
                }
                _ => return,
            };

            let Some(key) = K::from_key(&raw_key) else {
                tracing::warn!("Skipping entry with unparsable key {} on map {}", raw_key, map);
                return;
            };
            match (decode_opt::<V>(value), decode_opt::<V>(old_value)) {
                (Ok(value), Ok(old_value)) => listener(EntryEvent {
                    kind,
                    key,
                    value,
                    old_value,
                }),
                _ => tracing::warn!("Skipping undecodable entry {} on map {}", raw_key, map),
            }
        });

        self.hub.subscribe(StructureKind::Map, &self.name, handler).await
    }

    pub fn remove_entry_listener(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }
}

fn decode_opt<V: StoreValue>(json: Option<String>) -> Result<Option<V>> {
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}
