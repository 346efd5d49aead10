//! Typed FIFO queue shared by every node connected to the same store.
//!
//! `poll` is non-blocking: it returns `None` immediately when the queue is
//! empty. Callers that want to wait register an item listener and poll again
//! when an item is added.

use std::marker::PhantomData;
use std::sync::Arc;

use super::backend::StoreBackend;
use super::listeners::ListenerHub;
use super::map::DistributedMap;
use super::types::*;
use crate::error::Result;

pub struct DistributedQueue<T> {
    name: String,
    backend: Arc<dyn StoreBackend>,
    hub: Arc<ListenerHub>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DistributedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            hub: self.hub.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: StoreValue> DistributedQueue<T> {
    pub(crate) fn new(name: &str, backend: Arc<dyn StoreBackend>, hub: Arc<ListenerHub>) -> Self {
        Self {
            name: name.to_string(),
            backend,
            hub,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends to the tail. Always accepted (the queue is unbounded).
    pub async fn add(&self, item: &T) -> Result<bool> {
        let json = serde_json::to_string(item)?;
        self.backend.queue_offer(&self.name, vec![json]).await?;
        Ok(true)
    }

    /// Appends `item` at most once per `op_id`, however often a failed call
    /// is retried with the same id.
    pub async fn add_once(&self, item: &T, op_id: &str) -> Result<()> {
        let json = serde_json::to_string(item)?;
        self.backend.queue_offer_once(&self.name, op_id, vec![json]).await
    }

    pub async fn add_all(&self, items: &[T]) -> Result<bool> {
        if items.is_empty() {
            return Ok(false);
        }
        let encoded = items
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.backend.queue_offer(&self.name, encoded).await?;
        Ok(true)
    }

    /// Removes and returns the head, or `None` if the queue is empty.
    ///
    /// Atomic across all nodes: concurrent pollers never receive the same item.
    pub async fn poll(&self) -> Result<Option<T>> {
        match self.backend.queue_poll(&self.name).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn peek(&self) -> Result<Option<T>> {
        match self.backend.queue_peek(&self.name).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Removes every queued item equal to one of `items`. Returns true if the
    /// queue changed.
    pub async fn remove_all(&self, items: &[T]) -> Result<bool> {
        let encoded = items
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.backend.queue_remove_all(&self.name, encoded).await
    }

    /// Removes the queued item whose `id` field equals `id`.
    pub async fn remove_by_id(&self, id: &str) -> Result<bool> {
        self.backend.queue_remove_by_key(&self.name, id).await
    }

    /// Snapshot of the queue contents, head first.
    pub async fn get_all(&self) -> Result<Vec<T>> {
        self.backend
            .queue_items(&self.name)
            .await?
            .iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    pub async fn size(&self) -> Result<usize> {
        self.backend.queue_len(&self.name).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    /// Polls the head into `map` in a single store operation.
    ///
    /// The fields of `patch` overwrite the item's before it is stored under
    /// its `id`. Returns the stored value, or `None` if the queue was empty.
    /// Items without a usable `id` are moved to the dead-letter queue rather
    /// than blocking the head.
    pub async fn poll_into<K, V, P>(&self, map: &DistributedMap<K, V>, patch: &P) -> Result<Option<V>>
    where
        K: MapKey,
        V: StoreValue,
        P: serde::Serialize,
    {
        let patch = serde_json::to_string(patch)?;
        match self
            .backend
            .queue_poll_into_map(&self.name, map.name(), patch)
            .await?
        {
            Some((_, value)) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Invokes `listener` for every item added to or removed from the queue
    /// after registration. Runs on a dedicated task, never inline with the
    /// queue operation.
    pub async fn add_item_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(ItemEvent<T>) + Send + Sync + 'static,
    {
        let queue = self.name.clone();
        let handler = Arc::new(move |event: StoreEvent| {
            let (kind, json) = match event {
                StoreEvent::ItemAdded { item } => (ItemEventKind::Added, item),
                StoreEvent::ItemRemoved { item } => (ItemEventKind::Removed, item),
                _ => return,
            };
            match serde_json::from_str::<T>(&json) {
                Ok(item) => listener(ItemEvent { kind, item }),
                Err(e) => tracing::warn!("Skipping undecodable item on queue {}: {}", queue, e),
            }
        });

        self.hub
            .subscribe(StructureKind::Queue, &self.name, handler)
            .await
    }

    pub fn remove_item_listener(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }
}
