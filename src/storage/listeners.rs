//! Listener dispatch.
//!
//! Each registered listener gets its own task that long-polls the structure's
//! event log and invokes the callback. Callbacks therefore never run on the
//! thread that mutated the structure, and a slow or panicking callback only
//! delays its own listener.
//!
//! A listener starts reading at the log's current end: it observes changes
//! made after registration, never history.
//!
//! Delivery is at-least-once as long as a listener stays within the store's
//! event capacity (`StoreConfig::event_capacity`). Events trimmed from the
//! log before the listener reads them are reported as skipped, not replayed.

use dashmap::DashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::backend::StoreBackend;
use super::types::{ListenerId, StoreEvent, StructureKind};
use crate::error::Result;

/// How long a single event read may block waiting for new events.
pub const DEFAULT_LISTENER_WAIT: Duration = Duration::from_secs(1);

pub type EventHandler = Arc<dyn Fn(StoreEvent) + Send + Sync>;

pub struct ListenerHub {
    backend: Arc<dyn StoreBackend>,
    listeners: DashMap<ListenerId, JoinHandle<()>>,
    wait: Duration,
}

impl ListenerHub {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Arc<Self> {
        Self::with_wait(backend, DEFAULT_LISTENER_WAIT)
    }

    pub fn with_wait(backend: Arc<dyn StoreBackend>, wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend,
            listeners: DashMap::new(),
            wait,
        })
    }

    /// Registers `handler` for events on `kind`/`name` published from now on.
    pub async fn subscribe(
        &self,
        kind: StructureKind,
        name: &str,
        handler: EventHandler,
    ) -> Result<ListenerId> {
        let cursor = self.backend.event_cursor(kind, name).await?;
        let id = ListenerId::new();

        let backend = self.backend.clone();
        let name = name.to_string();
        let wait = self.wait;
        let handle = tokio::spawn(async move {
            dispatch_loop(backend, kind, name, cursor, wait, handler).await;
        });

        self.listeners.insert(id, handle);
        tracing::debug!("Registered listener {} (from cursor {})", id, cursor);
        Ok(id)
    }

    /// Stops the listener. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.listeners.remove(&id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stops every listener registered through this hub.
    pub fn unsubscribe_all(&self) {
        let ids: Vec<ListenerId> = self.listeners.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.unsubscribe(id);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Drop for ListenerHub {
    fn drop(&mut self) {
        for entry in self.listeners.iter() {
            entry.value().abort();
        }
    }
}

async fn dispatch_loop(
    backend: Arc<dyn StoreBackend>,
    kind: StructureKind,
    name: String,
    mut cursor: u64,
    wait: Duration,
    handler: EventHandler,
) {
    let mut delay_ms = 150u64;

    loop {
        match backend.events_since(kind, &name, cursor, wait).await {
            Ok(batch) => {
                delay_ms = 150;
                if batch.skipped > 0 {
                    tracing::warn!(
                        "Listener on {} {} fell behind, {} events dropped",
                        kind,
                        name,
                        batch.skipped
                    );
                }

                for sequenced in batch.events {
                    let outcome =
                        std::panic::catch_unwind(AssertUnwindSafe(|| handler(sequenced.event)));
                    if outcome.is_err() {
                        tracing::error!(
                            "Listener callback on {} {} panicked at event {}",
                            kind,
                            name,
                            sequenced.seq
                        );
                    }
                }
                cursor = batch.cursor;
            }
            Err(e) => {
                tracing::warn!("Listener on {} {} cannot read events: {}", kind, name, e);
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }
}
