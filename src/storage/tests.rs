//! Storage Module Tests
//!
//! Validates the shared structures against the in-process backend.
//!
//! ## Test Scopes
//! - **Queue**: FIFO order, non-blocking poll, atomic poll under contention.
//! - **Map**: CRUD, compare-and-set, per-key locking and lock expiry.
//! - **Transfers**: queue -> map and map -> queue moves.
//! - **Listeners**: asynchronous delivery, removal, lagging readers.
//! - **Replay**: at-most-once application of retried store-server operations.
//! - **Faults**: behaviour while the store is unreachable.
//!
//! *Note: the HTTP backend is exercised in `tests/remote_store_tests.rs`.*

#[cfg(test)]
mod tests {
    use crate::config::StoreConfig;
    use crate::error::{CoordinatorError, Result};
    use crate::storage::backend::StoreBackend;
    use crate::storage::handlers::{MAX_CACHED_OPS, StoreServer};
    use crate::storage::memory::{MemoryStore, merge_patch, same_json};
    use crate::storage::provider::DataProvider;
    use crate::storage::types::{EntryEventKind, ItemEventKind, StructureKind, dead_letter_queue};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    // Test data structure
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestJob {
        id: String,
        payload: String,
        #[serde(default)]
        owner: Option<String>,
    }

    fn job(id: &str) -> TestJob {
        TestJob {
            id: id.to_string(),
            payload: format!("payload-{}", id),
            owner: None,
        }
    }

    fn test_config() -> StoreConfig {
        StoreConfig {
            lock_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn provider(store: &Arc<MemoryStore>, member: &str) -> DataProvider {
        DataProvider::new(store.clone(), member, &test_config())
    }

    async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    // ============================================================
    // QUEUE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let store = Arc::new(MemoryStore::new());
        let queue = provider(&store, "node-a").get_queue::<TestJob>("jobs");

        queue.add(&job("1")).await.unwrap();
        queue.add_all(&[job("2"), job("3")]).await.unwrap();

        assert_eq!(queue.size().await.unwrap(), 3);
        assert_eq!(queue.peek().await.unwrap(), Some(job("1")));
        assert_eq!(queue.poll().await.unwrap(), Some(job("1")));
        assert_eq!(queue.poll().await.unwrap(), Some(job("2")));
        assert_eq!(queue.poll().await.unwrap(), Some(job("3")));
    }

    #[tokio::test]
    async fn test_poll_on_empty_queue_returns_immediately() {
        let store = Arc::new(MemoryStore::new());
        let queue = provider(&store, "node-a").get_queue::<TestJob>("jobs");

        let result = tokio::time::timeout(Duration::from_millis(100), queue.poll()).await;

        assert!(result.is_ok(), "poll must not block on an empty queue");
        assert_eq!(result.unwrap().unwrap(), None);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_pollers_never_share_an_item() {
        // ARRANGE: 100 items, two nodes with four pollers each
        let store = Arc::new(MemoryStore::new());
        let producer = provider(&store, "producer").get_queue::<TestJob>("jobs");
        let items: Vec<TestJob> = (0..100).map(|i| job(&i.to_string())).collect();
        producer.add_all(&items).await.unwrap();

        let mut handles = Vec::new();
        for node in 0..2 {
            let queue = provider(&store, &format!("node-{}", node)).get_queue::<TestJob>("jobs");
            for _ in 0..4 {
                let queue = queue.clone();
                handles.push(tokio::spawn(async move {
                    let mut taken = Vec::new();
                    while let Some(item) = queue.poll().await.unwrap() {
                        taken.push(item.id);
                        tokio::task::yield_now().await;
                    }
                    taken
                }));
            }
        }

        // ACT
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        // ASSERT
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 100, "every item delivered");
        assert_eq!(unique.len(), 100, "no item delivered twice");
    }

    #[tokio::test]
    async fn test_remove_all_and_remove_by_id() {
        let store = Arc::new(MemoryStore::new());
        let queue = provider(&store, "node-a").get_queue::<TestJob>("jobs");
        queue
            .add_all(&[job("1"), job("2"), job("3"), job("4")])
            .await
            .unwrap();

        assert!(queue.remove_all(&[job("2"), job("9")]).await.unwrap());
        assert!(!queue.remove_all(&[job("9")]).await.unwrap());
        assert!(queue.remove_by_id("4").await.unwrap());
        assert!(!queue.remove_by_id("4").await.unwrap());

        let ids: Vec<String> = queue.get_all().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    // ============================================================
    // MAP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_map_crud() {
        let store = Arc::new(MemoryStore::new());
        let map = provider(&store, "node-a").get_map::<String, TestJob>("running");

        assert_eq!(map.put(&"1".to_string(), &job("1")).await.unwrap(), None);
        assert_eq!(
            map.put(&"1".to_string(), &job("1")).await.unwrap(),
            Some(job("1"))
        );
        map.put(&"2".to_string(), &job("2")).await.unwrap();

        assert_eq!(map.size().await.unwrap(), 2);
        assert_eq!(map.get(&"2".to_string()).await.unwrap(), Some(job("2")));

        let found = map
            .get_all(&["1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("1"));

        let mut keys = map.key_set().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["1", "2"]);
        assert_eq!(map.values().await.unwrap().len(), 2);
        assert_eq!(map.entry_set().await.unwrap().len(), 2);

        assert_eq!(map.remove(&"1".to_string()).await.unwrap(), Some(job("1")));
        map.clear().await.unwrap();
        assert_eq!(map.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_current_value() {
        let store = Arc::new(MemoryStore::new());
        let map = provider(&store, "node-a").get_map::<String, TestJob>("running");
        let key = "1".to_string();
        let original = job("1");
        let mut claimed = job("1");
        claimed.owner = Some("agent-a".to_string());

        // Absent-only insert
        assert!(map.compare_and_set(&key, None, Some(&original)).await.unwrap());
        assert!(!map.compare_and_set(&key, None, Some(&original)).await.unwrap());

        // Stale expectation is rejected
        assert!(!map.compare_and_set(&key, Some(&claimed), Some(&original)).await.unwrap());
        assert!(map.compare_and_set(&key, Some(&original), Some(&claimed)).await.unwrap());

        // Removal
        assert!(map.compare_and_set(&key, Some(&claimed), None).await.unwrap());
        assert_eq!(map.get(&key).await.unwrap(), None);
    }

    #[test]
    fn test_json_comparison_ignores_field_order() {
        assert!(same_json(r#"{"a":1,"b":"x"}"#, r#"{"b":"x","a":1}"#));
        assert!(!same_json(r#"{"a":1}"#, r#"{"a":2}"#));
        assert!(!same_json("not json", "other"));
    }

    #[test]
    fn test_merge_patch_overwrites_fields() {
        let merged = merge_patch(r#"{"id":"1","owner":null,"n":1}"#, r#"{"owner":"a"}"#).unwrap();
        assert!(same_json(&merged, r#"{"id":"1","owner":"a","n":1}"#));
        assert!(merge_patch(r#"[1,2]"#, r#"{"owner":"a"}"#).is_err());
    }

    // ============================================================
    // LOCK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_lock_is_exclusive_and_not_reentrant() {
        let store = Arc::new(MemoryStore::new());
        let node_a = provider(&store, "node-a").get_map::<String, TestJob>("running");
        let node_b = provider(&store, "node-b").get_map::<String, TestJob>("running");
        let key = "job-1".to_string();

        node_a.lock(&key).await.unwrap();

        // Same handle again: no re-entry
        let again = node_a.lock(&key).await;
        assert!(matches!(again, Err(CoordinatorError::LockTimeout { .. })));

        // Another node
        let other = node_b.lock(&key).await;
        assert!(matches!(other, Err(CoordinatorError::LockTimeout { .. })));

        // Unlock hands it over
        assert!(node_a.unlock(&key).await.unwrap());
        node_b.lock(&key).await.unwrap();
        assert!(node_b.unlock(&key).await.unwrap());

        // Unlocking something not held
        assert!(!node_a.unlock(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_timeout_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let map = provider(&store, "node-a").get_map::<String, TestJob>("running");
        let key = "job-1".to_string();
        map.lock(&key).await.unwrap();

        let started = std::time::Instant::now();
        let result = map.lock(&key).await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2), "lock wait must be bounded");
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let config = StoreConfig {
            lock_timeout: Duration::from_millis(50),
            lock_lease: Duration::from_millis(50),
            ..Default::default()
        };
        let dead = DataProvider::new(store.clone(), "dead", &config).get_map::<String, TestJob>("m");
        let alive = DataProvider::new(store.clone(), "alive", &config).get_map::<String, TestJob>("m");
        let key = "job-1".to_string();

        dead.lock(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        alive.lock(&key).await.unwrap();
        assert!(!dead.unlock(&key).await.unwrap(), "expired holder cannot unlock");
        assert!(alive.unlock(&key).await.unwrap());
    }

    // ============================================================
    // TRANSFER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_poll_into_moves_head_into_map() {
        let store = Arc::new(MemoryStore::new());
        let node = provider(&store, "node-a");
        let queue = node.get_queue::<TestJob>("jobs");
        let map = node.get_map::<String, TestJob>("running");
        queue.add_all(&[job("1"), job("2")]).await.unwrap();

        let claimed = queue
            .poll_into(&map, &serde_json::json!({ "owner": "agent-a" }))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.id, "1");
        assert_eq!(claimed.owner.as_deref(), Some("agent-a"));
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(map.get(&"1".to_string()).await.unwrap(), Some(claimed.clone()));

        // The stored value matches the typed one despite field reordering
        let mut released = claimed.clone();
        released.owner = None;
        assert!(
            map.compare_and_set(&"1".to_string(), Some(&claimed), Some(&released))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_poll_into_dead_letters_malformed_head() {
        // ARRANGE: two unusable items ahead of a real one
        let store = Arc::new(MemoryStore::new());
        store
            .queue_offer(
                "jobs",
                vec![
                    r#"{"payload":"no id"}"#.to_string(),
                    "not json".to_string(),
                    serde_json::to_string(&job("1")).unwrap(),
                ],
            )
            .await
            .unwrap();
        let node = provider(&store, "node-a");
        let queue = node.get_queue::<TestJob>("jobs");
        let map = node.get_map::<String, TestJob>("running");

        // ACT
        let claimed = queue.poll_into(&map, &serde_json::json!({})).await.unwrap();

        // ASSERT: the real item got through and the bad ones were set aside
        assert_eq!(claimed, Some(job("1")));
        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(map.size().await.unwrap(), 1);
        assert_eq!(
            store.queue_items(&dead_letter_queue("jobs")).await.unwrap(),
            vec![r#"{"payload":"no id"}"#.to_string(), "not json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_poll_into_rejects_bad_patch_without_touching_queue() {
        let store = Arc::new(MemoryStore::new());
        let node = provider(&store, "node-a");
        let queue = node.get_queue::<TestJob>("jobs");
        let map = node.get_map::<String, TestJob>("running");
        queue.add(&job("1")).await.unwrap();

        let result = queue.poll_into(&map, &serde_json::json!(["not", "an", "object"])).await;

        assert!(matches!(result, Err(CoordinatorError::Protocol(_))));
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(store.queue_len(&dead_letter_queue("jobs")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transfer_to_queue_only_moves_expected_value() {
        let store = Arc::new(MemoryStore::new());
        let node = provider(&store, "node-a");
        let queue = node.get_queue::<TestJob>("jobs");
        let map = node.get_map::<String, TestJob>("running");
        let key = "1".to_string();
        let mut running = job("1");
        running.owner = Some("agent-a".to_string());
        map.put(&key, &running).await.unwrap();

        // Stale expectation: nothing moves
        let moved = map
            .transfer_to_queue(&key, &job("1"), &queue, &job("1"))
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(map.size().await.unwrap(), 1);
        assert!(queue.is_empty().await.unwrap());

        // Current expectation: exactly one copy ends up in the queue
        let moved = map
            .transfer_to_queue(&key, &running, &queue, &job("1"))
            .await
            .unwrap();
        assert!(moved);
        assert_eq!(map.size().await.unwrap(), 0);
        assert_eq!(queue.get_all().await.unwrap(), vec![job("1")]);
    }

    // ============================================================
    // LISTENER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_item_listener_sees_adds_and_removes() {
        let store = Arc::new(MemoryStore::new());
        let queue = provider(&store, "node-a").get_queue::<TestJob>("jobs");
        let (tx, mut rx) = mpsc::unbounded_channel();

        queue
            .add_item_listener(move |event| {
                let _ = tx.send((event.kind, event.item.id));
            })
            .await
            .unwrap();

        queue.add(&job("1")).await.unwrap();
        queue.poll().await.unwrap();

        assert_eq!(
            recv_within(&mut rx).await,
            Some((ItemEventKind::Added, "1".to_string()))
        );
        assert_eq!(
            recv_within(&mut rx).await,
            Some((ItemEventKind::Removed, "1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_entry_listener_sees_every_change_kind() {
        let store = Arc::new(MemoryStore::new());
        let writer = provider(&store, "writer").get_map::<String, TestJob>("running");
        let watcher = provider(&store, "watcher").get_map::<String, TestJob>("running");
        let (tx, mut rx) = mpsc::unbounded_channel();

        watcher
            .add_entry_listener(move |event| {
                let _ = tx.send((event.kind, event.key, event.value.is_some(), event.old_value.is_some()));
            })
            .await
            .unwrap();

        let key = "1".to_string();
        writer.put(&key, &job("1")).await.unwrap();
        writer.put(&key, &job("1")).await.unwrap();
        writer.remove(&key).await.unwrap();

        assert_eq!(
            recv_within(&mut rx).await,
            Some((EntryEventKind::Added, key.clone(), true, false))
        );
        assert_eq!(
            recv_within(&mut rx).await,
            Some((EntryEventKind::Updated, key.clone(), true, true))
        );
        assert_eq!(
            recv_within(&mut rx).await,
            Some((EntryEventKind::Removed, key.clone(), false, true))
        );
    }

    #[tokio::test]
    async fn test_removed_listener_stops_receiving() {
        let store = Arc::new(MemoryStore::new());
        let node = provider(&store, "node-a");
        let topic = node.get_topic::<String>("control");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = topic
            .add_message_listener(move |msg| {
                let _ = tx.send(msg);
            })
            .await
            .unwrap();
        topic.publish(&"first".to_string()).await.unwrap();
        assert_eq!(recv_within(&mut rx).await.as_deref(), Some("first"));

        assert!(topic.remove_message_listener(id));
        assert!(!topic.remove_message_listener(id));
        assert_eq!(node.listener_count(), 0);

        topic.publish(&"second".to_string()).await.unwrap();
        let late = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(late, Ok(Some(_))), "no delivery after removal");
    }

    #[tokio::test]
    async fn test_topic_does_not_replay_history() {
        let store = Arc::new(MemoryStore::new());
        let topic = provider(&store, "node-a").get_topic::<String>("control");
        topic.publish(&"before".to_string()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        topic
            .add_message_listener(move |msg| {
                let _ = tx.send(msg);
            })
            .await
            .unwrap();
        topic.publish(&"after".to_string()).await.unwrap();

        assert_eq!(recv_within(&mut rx).await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_lagging_reader_is_told_about_skipped_events() {
        let store = MemoryStore::with_event_capacity(2);
        for i in 0..5 {
            store.topic_publish("t", format!("\"m{}\"", i)).await.unwrap();
        }

        let batch = store
            .events_since(StructureKind::Topic, "t", 0, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.skipped, 3);
        assert_eq!(batch.cursor, 5);
    }

    #[tokio::test]
    async fn test_provider_honours_configured_event_capacity() {
        let config = StoreConfig {
            event_capacity: 3,
            ..Default::default()
        };
        let node = DataProvider::from_config("node-a", &config);
        let topic = node.get_topic::<String>("t");
        for i in 0..5 {
            topic.publish(&format!("m{}", i)).await.unwrap();
        }

        let batch = node
            .backend()
            .events_since(StructureKind::Topic, "t", 0, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.skipped, 2);
    }

    #[tokio::test]
    async fn test_event_wait_wakes_on_new_event() {
        let store = Arc::new(MemoryStore::new());
        let reader = store.clone();
        let waiter = tokio::spawn(async move {
            reader
                .events_since(StructureKind::Queue, "jobs", 0, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .queue_offer("jobs", vec![r#"{"id":"1"}"#.to_string()])
            .await
            .unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("long poll should wake promptly")
            .unwrap()
            .unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    // ============================================================
    // REPLAY TESTS
    // ============================================================

    async fn delayed_poll(store: Arc<MemoryStore>) -> Result<Option<String>> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.queue_poll("jobs").await
    }

    #[tokio::test]
    async fn test_overlapping_duplicate_op_is_applied_once() {
        // ARRANGE
        let server = StoreServer::new(Arc::new(MemoryStore::new()));
        let store = server.store().clone();
        store
            .queue_offer("jobs", vec![r#""a""#.to_string(), r#""b""#.to_string()])
            .await
            .unwrap();

        // ACT: a retry arrives while the original request is still running
        let (original, retry) = tokio::join!(
            server.once("op-1", || delayed_poll(store.clone())),
            server.once("op-1", || delayed_poll(store.clone()))
        );

        // ASSERT
        assert_eq!(original.unwrap(), Some(r#""a""#.to_string()));
        assert_eq!(retry.unwrap(), Some(r#""a""#.to_string()));
        assert_eq!(store.queue_len("jobs").await.unwrap(), 1);

        let late_retry = server.once("op-1", || delayed_poll(store.clone())).await;
        assert_eq!(late_retry.unwrap(), Some(r#""a""#.to_string()));
        assert_eq!(store.queue_len("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_op_is_not_cached() {
        let server = StoreServer::new(Arc::new(MemoryStore::new()));
        let store = server.store().clone();
        store.queue_offer("jobs", vec![r#""a""#.to_string()]).await.unwrap();

        let failed = server
            .once("op-1", || async {
                Err::<Option<String>, _>(CoordinatorError::StoreUnavailable("down".to_string()))
            })
            .await;
        let retried = server.once("op-1", || delayed_poll(store.clone())).await;

        assert!(matches!(failed, Err(CoordinatorError::StoreUnavailable(_))));
        assert_eq!(retried.unwrap(), Some(r#""a""#.to_string()));
    }

    #[tokio::test]
    async fn test_replay_cache_evicts_oldest_ops_first() {
        let server = StoreServer::new(Arc::new(MemoryStore::new()));
        for i in 0..=MAX_CACHED_OPS {
            let value: u64 = server
                .once(&format!("op-{}", i), || async move { Ok(i as u64) })
                .await
                .unwrap();
            assert_eq!(value, i as u64);
        }

        assert_eq!(server.cached_ops(), MAX_CACHED_OPS);
        // Everything but the very first op is still replayed
        let replayed: u64 = server.once("op-1", || async { Ok(999) }).await.unwrap();
        assert_eq!(replayed, 1);
        let rerun: u64 = server.once("op-0", || async { Ok(999) }).await.unwrap();
        assert_eq!(rerun, 999);
    }

    // ============================================================
    // FAULT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unreachable_store_fails_without_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let queue = provider(&store, "node-a").get_queue::<TestJob>("jobs");
        queue.add(&job("1")).await.unwrap();

        store.set_reachable(false);
        let polled = queue.poll().await;
        let added = queue.add(&job("2")).await;
        store.set_reachable(true);

        assert!(matches!(polled, Err(CoordinatorError::StoreUnavailable(_))));
        assert!(matches!(added, Err(CoordinatorError::StoreUnavailable(_))));
        assert_eq!(queue.get_all().await.unwrap(), vec![job("1")]);
    }
}
