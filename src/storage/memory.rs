//! In-process store.
//!
//! Backs single-node mode and tests directly, and is the state held by the
//! shared store server in multi-node deployments.
//!
//! ## Concurrency
//! Every structure lives behind its own mutex, so operations on one structure
//! are serialized and its event log records changes in the exact order they
//! were applied. Operations touching a queue and a map always lock the queue
//! first.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::backend::StoreBackend;
use super::types::*;
use crate::error::{CoordinatorError, Result};

/// Events kept per structure for listeners that are catching up.
///
/// Listener delivery is at-least-once only within this window: a listener
/// that falls more than this many events behind loses the oldest ones and
/// logs how many it skipped. Override with `MemoryStore::with_event_capacity`
/// (`StoreConfig::event_capacity`).
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

struct EventLog {
    last_seq: u64,
    events: VecDeque<SequencedEvent>,
    capacity: usize,
    notify: Arc<Notify>,
}

impl EventLog {
    fn new(capacity: usize) -> Self {
        Self {
            last_seq: 0,
            events: VecDeque::new(),
            capacity: capacity.max(1),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, event: StoreEvent) {
        self.last_seq += 1;
        self.events.push_back(SequencedEvent {
            seq: self.last_seq,
            event,
        });
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        self.notify.notify_waiters();
    }

    fn since(&self, after: u64) -> EventBatch {
        // A cursor from the future (e.g. the store restarted) resyncs to now.
        let after = after.min(self.last_seq);
        let oldest = self.events.front().map(|e| e.seq).unwrap_or(self.last_seq + 1);
        let skipped = oldest.saturating_sub(after + 1);

        EventBatch {
            events: self
                .events
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect(),
            cursor: self.last_seq,
            skipped,
        }
    }
}

struct QueueState {
    items: VecDeque<String>,
    log: EventLog,
}

struct LockHolder {
    owner: String,
    expires_at: Instant,
}

struct MapState {
    entries: HashMap<String, String>,
    locks: HashMap<String, LockHolder>,
    log: EventLog,
}

impl MapState {
    fn insert(&mut self, key: String, value: String) -> Option<String> {
        let previous = self.entries.insert(key.clone(), value.clone());
        self.log.push(match &previous {
            None => StoreEvent::EntryAdded { key, value },
            Some(old) => StoreEvent::EntryUpdated {
                key,
                value,
                old_value: old.clone(),
            },
        });
        previous
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        let previous = self.entries.remove(key);
        if let Some(old) = &previous {
            self.log.push(StoreEvent::EntryRemoved {
                key: key.to_string(),
                old_value: old.clone(),
            });
        }
        previous
    }
}

struct TopicState {
    log: EventLog,
}

pub struct MemoryStore {
    queues: DashMap<String, Arc<Mutex<QueueState>>>,
    maps: DashMap<String, Arc<Mutex<MapState>>>,
    topics: DashMap<String, Arc<Mutex<TopicState>>>,
    reachable: AtomicBool,
    event_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            maps: DashMap::new(),
            topics: DashMap::new(),
            reachable: AtomicBool::new(true),
            event_capacity,
        }
    }

    /// Fault injection: while unreachable, every operation fails with
    /// `StoreUnavailable` and no state changes.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        tracing::info!("Memory store reachable={}", reachable);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(CoordinatorError::StoreUnavailable(
                "memory store marked unreachable".to_string(),
            ))
        }
    }

    fn queue(&self, name: &str) -> Arc<Mutex<QueueState>> {
        let capacity = self.event_capacity;
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(QueueState {
                    items: VecDeque::new(),
                    log: EventLog::new(capacity),
                }))
            })
            .clone()
    }

    fn map(&self, name: &str) -> Arc<Mutex<MapState>> {
        let capacity = self.event_capacity;
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(MapState {
                    entries: HashMap::new(),
                    locks: HashMap::new(),
                    log: EventLog::new(capacity),
                }))
            })
            .clone()
    }

    fn topic(&self, name: &str) -> Arc<Mutex<TopicState>> {
        let capacity = self.event_capacity;
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TopicState {
                    log: EventLog::new(capacity),
                }))
            })
            .clone()
    }

    fn with_log<R>(&self, kind: StructureKind, name: &str, f: impl FnOnce(&mut EventLog) -> R) -> R {
        match kind {
            StructureKind::Queue => f(&mut self.queue(name).lock().log),
            StructureKind::Map => f(&mut self.map(name).lock().log),
            StructureKind::Topic => f(&mut self.topic(name).lock().log),
        }
    }
}

/// Reads the identity field of a JSON object item.
pub fn item_key(item: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(item)?;
    match value.get(KEY_FIELD) {
        Some(serde_json::Value::String(key)) => Ok(key.clone()),
        Some(serde_json::Value::Number(key)) => Ok(key.to_string()),
        _ => Err(CoordinatorError::Protocol(format!(
            "item has no '{}' field usable as a key",
            KEY_FIELD
        ))),
    }
}

/// Structural equality of two JSON documents, so that field order produced by
/// different serializers does not matter. Falls back to byte equality for
/// non-JSON payloads.
pub fn same_json(stored: &str, expected: &str) -> bool {
    if stored == expected {
        return true;
    }
    match (
        serde_json::from_str::<serde_json::Value>(stored),
        serde_json::from_str::<serde_json::Value>(expected),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Shallow JSON merge: every top-level field of `patch` overwrites `item`'s.
pub fn merge_patch(item: &str, patch: &str) -> Result<String> {
    let mut base: serde_json::Value = serde_json::from_str(item)?;
    let patch: serde_json::Value = serde_json::from_str(patch)?;

    match (base.as_object_mut(), patch) {
        (Some(target), serde_json::Value::Object(fields)) => {
            for (field, value) in fields {
                target.insert(field, value);
            }
        }
        _ => {
            return Err(CoordinatorError::Protocol(
                "transfer item and patch must both be JSON objects".to_string(),
            ));
        }
    }

    Ok(serde_json::to_string(&base)?)
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn queue_offer(&self, queue: &str, items: Vec<String>) -> Result<()> {
        self.ensure_reachable()?;
        let queue = self.queue(queue);
        let mut state = queue.lock();
        for item in items {
            state.items.push_back(item.clone());
            state.log.push(StoreEvent::ItemAdded { item });
        }
        Ok(())
    }

    async fn queue_poll(&self, queue: &str) -> Result<Option<String>> {
        self.ensure_reachable()?;
        let queue = self.queue(queue);
        let mut state = queue.lock();
        let item = state.items.pop_front();
        if let Some(item) = &item {
            state.log.push(StoreEvent::ItemRemoved { item: item.clone() });
        }
        Ok(item)
    }

    async fn queue_peek(&self, queue: &str) -> Result<Option<String>> {
        self.ensure_reachable()?;
        Ok(self.queue(queue).lock().items.front().cloned())
    }

    async fn queue_remove_all(&self, queue: &str, items: Vec<String>) -> Result<bool> {
        self.ensure_reachable()?;
        let queue = self.queue(queue);
        let mut state = queue.lock();

        let mut removed = Vec::new();
        state.items.retain(|item| {
            if items.iter().any(|candidate| same_json(item, candidate)) {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });

        let changed = !removed.is_empty();
        for item in removed {
            state.log.push(StoreEvent::ItemRemoved { item });
        }
        Ok(changed)
    }

    async fn queue_remove_by_key(&self, queue: &str, key: &str) -> Result<bool> {
        self.ensure_reachable()?;
        let queue = self.queue(queue);
        let mut state = queue.lock();

        let position = state
            .items
            .iter()
            .position(|item| item_key(item).map(|k| k == key).unwrap_or(false));

        match position.and_then(|idx| state.items.remove(idx)) {
            Some(item) => {
                state.log.push(StoreEvent::ItemRemoved { item });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_items(&self, queue: &str) -> Result<Vec<String>> {
        self.ensure_reachable()?;
        Ok(self.queue(queue).lock().items.iter().cloned().collect())
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        self.ensure_reachable()?;
        Ok(self.queue(queue).lock().items.len())
    }

    async fn queue_poll_into_map(
        &self,
        queue: &str,
        map: &str,
        patch: String,
    ) -> Result<Option<(String, String)>> {
        self.ensure_reachable()?;
        let patch_value: serde_json::Value = serde_json::from_str(&patch)?;
        if !patch_value.is_object() {
            return Err(CoordinatorError::Protocol(
                "transfer patch must be a JSON object".to_string(),
            ));
        }

        let queue_name = queue;
        let queue = self.queue(queue);
        let map = self.map(map);
        let mut rejected = Vec::new();

        let claimed = {
            let mut queue_state = queue.lock();
            loop {
                let Some(item) = queue_state.items.pop_front() else {
                    break None;
                };
                queue_state.log.push(StoreEvent::ItemRemoved { item: item.clone() });

                let keyed = merge_patch(&item, &patch)
                    .and_then(|merged| item_key(&merged).map(|key| (key, merged)));
                match keyed {
                    Ok((key, merged)) => {
                        map.lock().insert(key.clone(), merged.clone());
                        break Some((key, merged));
                    }
                    Err(e) => {
                        tracing::error!(
                            "Dead-lettering malformed item at the head of queue {}: {}",
                            queue_name,
                            e
                        );
                        rejected.push(item);
                    }
                }
            }
        };

        if !rejected.is_empty() {
            let dead_letters = self.queue(&dead_letter_queue(queue_name));
            let mut state = dead_letters.lock();
            for item in rejected {
                state.items.push_back(item.clone());
                state.log.push(StoreEvent::ItemAdded { item });
            }
        }

        Ok(claimed)
    }

    async fn map_get(&self, map: &str, key: &str) -> Result<Option<String>> {
        self.ensure_reachable()?;
        Ok(self.map(map).lock().entries.get(key).cloned())
    }

    async fn map_get_all(&self, map: &str, keys: Vec<String>) -> Result<Vec<(String, String)>> {
        self.ensure_reachable()?;
        let map = self.map(map);
        let state = map.lock();
        Ok(keys
            .into_iter()
            .filter_map(|key| state.entries.get(&key).cloned().map(|value| (key, value)))
            .collect())
    }

    async fn map_put(&self, map: &str, key: &str, value: String) -> Result<Option<String>> {
        self.ensure_reachable()?;
        Ok(self.map(map).lock().insert(key.to_string(), value))
    }

    async fn map_remove(&self, map: &str, key: &str) -> Result<Option<String>> {
        self.ensure_reachable()?;
        Ok(self.map(map).lock().remove(key))
    }

    async fn map_compare_and_set(
        &self,
        map: &str,
        key: &str,
        expected: Option<String>,
        replacement: Option<String>,
    ) -> Result<bool> {
        self.ensure_reachable()?;
        let map = self.map(map);
        let mut state = map.lock();

        let matches = match (state.entries.get(key), &expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => same_json(current, expected),
            _ => false,
        };
        if !matches {
            return Ok(false);
        }

        match replacement {
            Some(value) => {
                state.insert(key.to_string(), value);
            }
            None => {
                state.remove(key);
            }
        }
        Ok(true)
    }

    async fn map_transfer_to_queue(
        &self,
        map: &str,
        key: &str,
        expected: String,
        queue: &str,
        item: String,
    ) -> Result<bool> {
        self.ensure_reachable()?;
        let queue = self.queue(queue);
        let map = self.map(map);

        let mut queue_state = queue.lock();
        let mut map_state = map.lock();

        let matches = map_state
            .entries
            .get(key)
            .map(|current| same_json(current, &expected))
            .unwrap_or(false);
        if !matches {
            return Ok(false);
        }

        map_state.remove(key);
        queue_state.items.push_back(item.clone());
        queue_state.log.push(StoreEvent::ItemAdded { item });
        Ok(true)
    }

    async fn map_entries(&self, map: &str) -> Result<Vec<(String, String)>> {
        self.ensure_reachable()?;
        Ok(self
            .map(map)
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn map_len(&self, map: &str) -> Result<usize> {
        self.ensure_reachable()?;
        Ok(self.map(map).lock().entries.len())
    }

    async fn map_clear(&self, map: &str) -> Result<()> {
        self.ensure_reachable()?;
        let map = self.map(map);
        let mut state = map.lock();
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in keys {
            state.remove(&key);
        }
        Ok(())
    }

    async fn map_try_lock(
        &self,
        map: &str,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool> {
        self.ensure_reachable()?;
        let map = self.map(map);
        let mut state = map.lock();
        let now = Instant::now();

        if let Some(holder) = state.locks.get(key) {
            if holder.expires_at > now {
                return Ok(false);
            }
            tracing::warn!(
                "Lock on {} held by {} expired, granting to {}",
                key,
                holder.owner,
                owner
            );
        }

        state.locks.insert(
            key.to_string(),
            LockHolder {
                owner: owner.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn map_unlock(&self, map: &str, key: &str, owner: &str) -> Result<bool> {
        self.ensure_reachable()?;
        let map = self.map(map);
        let mut state = map.lock();

        let held = state
            .locks
            .get(key)
            .map(|holder| holder.owner == owner && holder.expires_at > Instant::now())
            .unwrap_or(false);

        if held {
            state.locks.remove(key);
        }
        Ok(held)
    }

    async fn topic_publish(&self, topic: &str, message: String) -> Result<()> {
        self.ensure_reachable()?;
        self.topic(topic)
            .lock()
            .log
            .push(StoreEvent::Message { payload: message });
        Ok(())
    }

    async fn event_cursor(&self, kind: StructureKind, name: &str) -> Result<u64> {
        self.ensure_reachable()?;
        Ok(self.with_log(kind, name, |log| log.last_seq))
    }

    async fn events_since(
        &self,
        kind: StructureKind,
        name: &str,
        after: u64,
        wait: Duration,
    ) -> Result<EventBatch> {
        self.ensure_reachable()?;
        let deadline = Instant::now() + wait;

        loop {
            let notify = self.with_log(kind, name, |log| log.notify.clone());
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before reading so a push in between is not missed.
            notified.as_mut().enable();

            let batch = self.with_log(kind, name, |log| log.since(after));
            if !batch.events.is_empty() || batch.skipped > 0 {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(batch);
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.with_log(kind, name, |log| log.since(after)));
            }
            self.ensure_reachable()?;
        }
    }
}
