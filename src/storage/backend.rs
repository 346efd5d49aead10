//! Backend seam for the distributed primitives.
//!
//! A backend stores queues, maps and topics by name and deals only in
//! serialized JSON strings. The typed wrappers (`DistributedQueue`,
//! `DistributedMap`, `DistributedTopic`) sit on top and are backend-agnostic.
//!
//! ## Implementations
//! - **`MemoryStore`**: in-process store for single-node mode and tests.
//! - **`RemoteStore`**: HTTP client for a shared store server.

use async_trait::async_trait;
use std::time::Duration;

use super::types::{EventBatch, StructureKind};
use crate::error::Result;

#[async_trait]
pub trait StoreBackend: Send + Sync {
    // --- Queue ---

    async fn queue_offer(&self, queue: &str, items: Vec<String>) -> Result<()>;

    /// Like `queue_offer`, but repeated calls carrying the same `op_id`
    /// append the items at most once. Callers retry a failed offer under the
    /// id they first used.
    ///
    /// The default suits in-process backends, whose failures never apply
    /// anything.
    async fn queue_offer_once(&self, queue: &str, _op_id: &str, items: Vec<String>) -> Result<()> {
        self.queue_offer(queue, items).await
    }

    /// Removes and returns the head. Atomic across every caller of the store.
    async fn queue_poll(&self, queue: &str) -> Result<Option<String>>;

    async fn queue_peek(&self, queue: &str) -> Result<Option<String>>;

    /// Removes every occurrence of the given items. Returns true if anything changed.
    async fn queue_remove_all(&self, queue: &str, items: Vec<String>) -> Result<bool>;

    /// Removes the first item whose `KEY_FIELD` equals `key`.
    async fn queue_remove_by_key(&self, queue: &str, key: &str) -> Result<bool>;

    async fn queue_items(&self, queue: &str) -> Result<Vec<String>>;

    async fn queue_len(&self, queue: &str) -> Result<usize>;

    /// Polls the head of `queue`, merges the JSON object `patch` into it and
    /// stores the result in `map` under its `KEY_FIELD`, all in one step.
    /// Head items that cannot be keyed are moved to `dead_letter_queue(queue)`
    /// and the next item is tried.
    async fn queue_poll_into_map(
        &self,
        queue: &str,
        map: &str,
        patch: String,
    ) -> Result<Option<(String, String)>>;

    // --- Map ---

    async fn map_get(&self, map: &str, key: &str) -> Result<Option<String>>;

    async fn map_get_all(&self, map: &str, keys: Vec<String>) -> Result<Vec<(String, String)>>;

    /// Returns the previous value, if any.
    async fn map_put(&self, map: &str, key: &str, value: String) -> Result<Option<String>>;

    async fn map_remove(&self, map: &str, key: &str) -> Result<Option<String>>;

    /// Applies `replacement` (or removal, if `None`) only when the current value
    /// equals `expected` (or is absent, if `None`).
    async fn map_compare_and_set(
        &self,
        map: &str,
        key: &str,
        expected: Option<String>,
        replacement: Option<String>,
    ) -> Result<bool>;

    /// Removes `key` if its value equals `expected` and appends `item` to
    /// `queue` in the same step.
    async fn map_transfer_to_queue(
        &self,
        map: &str,
        key: &str,
        expected: String,
        queue: &str,
        item: String,
    ) -> Result<bool>;

    async fn map_entries(&self, map: &str) -> Result<Vec<(String, String)>>;

    async fn map_len(&self, map: &str) -> Result<usize>;

    async fn map_clear(&self, map: &str) -> Result<()>;

    /// Non-blocking, non-reentrant acquire. A held lock expires after `lease`.
    async fn map_try_lock(&self, map: &str, key: &str, owner: &str, lease: Duration)
    -> Result<bool>;

    /// Returns false if `owner` did not hold the lock (never held, or expired).
    async fn map_unlock(&self, map: &str, key: &str, owner: &str) -> Result<bool>;

    // --- Topic ---

    async fn topic_publish(&self, topic: &str, message: String) -> Result<()>;

    // --- Events ---

    /// Sequence number of the newest event. Listeners start reading after it.
    async fn event_cursor(&self, kind: StructureKind, name: &str) -> Result<u64>;

    /// Events newer than `after`, waiting up to `wait` for one to arrive.
    async fn events_since(
        &self,
        kind: StructureKind,
        name: &str,
        after: u64,
        wait: Duration,
    ) -> Result<EventBatch>;
}
