//! Typed publish/subscribe topic.
//!
//! Delivery is fire-and-forget: a message reaches the listeners registered
//! when it was published. Nothing is stored for late subscribers.

use std::marker::PhantomData;
use std::sync::Arc;

use super::backend::StoreBackend;
use super::listeners::ListenerHub;
use super::types::*;
use crate::error::Result;

pub struct DistributedTopic<T> {
    name: String,
    backend: Arc<dyn StoreBackend>,
    hub: Arc<ListenerHub>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DistributedTopic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            hub: self.hub.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: StoreValue> DistributedTopic<T> {
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

    pub async fn publish(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.backend.topic_publish(&self.name, json).await
    }

    pub async fn add_message_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let topic = self.name.clone();
        let handler = Arc::new(move |event: StoreEvent| {
            if let StoreEvent::Message { payload } = event {
                match serde_json::from_str::<T>(&payload) {
                    Ok(message) => listener(message),
                    Err(e) => tracing::warn!("Dropping undecodable message on {}: {}", topic, e),
                }
            }
        });

        self.hub
            .subscribe(StructureKind::Topic, &self.name, handler)
            .await
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }
}
