//! Store server.
//!
//! Exposes a `MemoryStore` over HTTP so that every scheduler and agent
//! process shares the same queues, maps and topics.

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::backend::StoreBackend;
use super::memory::MemoryStore;
use super::protocol::*;
use super::types::StructureKind;
use crate::error::{CoordinatorError, Result};

pub(crate) const MAX_CACHED_OPS: usize = 10_000;

/// Shared store state plus the replay cache for retried operations.
pub struct StoreServer {
    store: Arc<MemoryStore>,
    processed_ops: DashMap<String, Arc<OnceCell<serde_json::Value>>>,
    op_order: Mutex<VecDeque<String>>,
}

impl StoreServer {
    pub fn new(store: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            processed_ops: DashMap::new(),
            op_order: Mutex::new(VecDeque::new()),
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Runs a mutating operation at most once per `op_id`, replaying the
    /// cached response for repeats.
    ///
    /// The op id is reserved before the operation runs, so a duplicate that
    /// arrives while the first request is still in progress waits for its
    /// response instead of applying the operation again. A failed operation
    /// caches nothing and may be retried under the same id.
    pub(crate) async fn once<T, F, Fut>(&self, op_id: &str, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if op_id.is_empty() {
            return op().await;
        }

        let (cell, reserved) = match self.processed_ops.entry(op_id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(Arc::new(OnceCell::new())).clone(), true),
        };
        if reserved {
            self.remember(op_id);
        } else {
            tracing::debug!("Replaying response for op {}", op_id);
        }

        let cached = cell
            .get_or_try_init(|| async move {
                let result = op().await?;
                Ok::<_, CoordinatorError>(serde_json::to_value(&result)?)
            })
            .await?;

        Ok(serde_json::from_value(cached.clone())?)
    }

    /// Records a reserved op id, evicting the oldest ones past the cap.
    fn remember(&self, op_id: &str) {
        let mut order = self.op_order.lock();
        order.push_back(op_id.to_string());
        while order.len() > MAX_CACHED_OPS {
            if let Some(oldest) = order.pop_front() {
                self.processed_ops.remove(&oldest);
            }
        }
    }

    pub fn cached_ops(&self) -> usize {
        self.processed_ops.len()
    }
}

/// Maps store errors onto HTTP status codes the client understands.
pub struct StoreApiError(CoordinatorError);

impl From<CoordinatorError> for StoreApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for StoreApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoordinatorError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::Protocol(_) | CoordinatorError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("Store request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, StoreApiError>;

pub fn store_router(server: Arc<StoreServer>) -> Router {
    Router::new()
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route("/queue/:name/offer", post(handle_queue_offer))
        .route("/queue/:name/poll", post(handle_queue_poll))
        .route("/queue/:name/peek", get(handle_queue_peek))
        .route("/queue/:name/remove_all", post(handle_queue_remove_all))
        .route("/queue/:name/remove_by_key", post(handle_queue_remove_by_key))
        .route("/queue/:name/items", get(handle_queue_items))
        .route("/queue/:name/size", get(handle_queue_size))
        .route("/queue/:name/poll_into", post(handle_queue_poll_into))
        .route("/map/:name/get", post(handle_map_get))
        .route("/map/:name/get_all", post(handle_map_get_all))
        .route("/map/:name/put", post(handle_map_put))
        .route("/map/:name/remove", post(handle_map_remove))
        .route("/map/:name/compare_and_set", post(handle_map_compare_and_set))
        .route("/map/:name/transfer", post(handle_map_transfer))
        .route("/map/:name/entries", get(handle_map_entries))
        .route("/map/:name/size", get(handle_map_size))
        .route("/map/:name/clear", post(handle_map_clear))
        .route("/map/:name/lock", post(handle_map_lock))
        .route("/map/:name/unlock", post(handle_map_unlock))
        .route("/topic/:name/publish", post(handle_topic_publish))
        .route("/events/:kind/:name", get(handle_events))
        .route("/events/:kind/:name/cursor", get(handle_event_cursor))
        .layer(Extension(server))
}

async fn handle_health(Extension(server): Extension<Arc<StoreServer>>) -> StatusCode {
    if server.store.is_reachable() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

// --- Queue ---

async fn handle_queue_offer(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<OfferRequest>,
) -> ApiResult<AckResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            store.queue_offer(&name, req.items).await?;
            Ok(AckResponse { success: true })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_queue_poll(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<OpRequest>,
) -> ApiResult<ItemResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(ItemResponse {
                item: store.queue_poll(&name).await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_queue_peek(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
) -> ApiResult<ItemResponse> {
    Ok(Json(ItemResponse {
        item: server.store.queue_peek(&name).await?,
    }))
}

async fn handle_queue_remove_all(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<RemoveItemsRequest>,
) -> ApiResult<AppliedResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(AppliedResponse {
                applied: store.queue_remove_all(&name, req.items).await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_queue_remove_by_key(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<RemoveByKeyRequest>,
) -> ApiResult<AppliedResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(AppliedResponse {
                applied: store.queue_remove_by_key(&name, &req.key).await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_queue_items(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
) -> ApiResult<ItemsResponse> {
    Ok(Json(ItemsResponse {
        items: server.store.queue_items(&name).await?,
    }))
}

async fn handle_queue_size(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
) -> ApiResult<SizeResponse> {
    Ok(Json(SizeResponse {
        size: server.store.queue_len(&name).await?,
    }))
}

async fn handle_queue_poll_into(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<PollIntoRequest>,
) -> ApiResult<TransferResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            let entry = store
                .queue_poll_into_map(&name, &req.map, req.patch)
                .await?
                .map(|(key, value_json)| KeyValueJson { key, value_json });
            Ok(TransferResponse { entry })
        })
        .await?;
    Ok(Json(response))
}

// --- Map ---

async fn handle_map_get(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<ValueResponse> {
    Ok(Json(ValueResponse {
        value_json: server.store.map_get(&name, &req.key).await?,
    }))
}

async fn handle_map_get_all(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<KeysRequest>,
) -> ApiResult<EntriesResponse> {
    let entries = server.store.map_get_all(&name, req.keys).await?;
    Ok(Json(EntriesResponse {
        entries: to_key_values(entries),
    }))
}

async fn handle_map_put(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<PutRequest>,
) -> ApiResult<ValueResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(ValueResponse {
                value_json: store.map_put(&name, &req.key, req.value_json).await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_map_remove(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<KeyOpRequest>,
) -> ApiResult<ValueResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(ValueResponse {
                value_json: store.map_remove(&name, &req.key).await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_map_compare_and_set(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<CompareAndSetRequest>,
) -> ApiResult<AppliedResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(AppliedResponse {
                applied: store
                    .map_compare_and_set(&name, &req.key, req.expected, req.replacement)
                    .await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_map_transfer(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<TransferToQueueRequest>,
) -> ApiResult<AppliedResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(AppliedResponse {
                applied: store
                    .map_transfer_to_queue(&name, &req.key, req.expected, &req.queue, req.item)
                    .await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_map_entries(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
) -> ApiResult<EntriesResponse> {
    let entries = server.store.map_entries(&name).await?;
    Ok(Json(EntriesResponse {
        entries: to_key_values(entries),
    }))
}

async fn handle_map_size(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
) -> ApiResult<SizeResponse> {
    Ok(Json(SizeResponse {
        size: server.store.map_len(&name).await?,
    }))
}

async fn handle_map_clear(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<OpRequest>,
) -> ApiResult<AckResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            store.map_clear(&name).await?;
            Ok(AckResponse { success: true })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_map_lock(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<LockRequest>,
) -> ApiResult<AppliedResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            let lease = Duration::from_millis(req.lease_ms);
            Ok(AppliedResponse {
                applied: store
                    .map_try_lock(&name, &req.key, &req.owner, lease)
                    .await?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn handle_map_unlock(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<UnlockRequest>,
) -> ApiResult<AppliedResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            Ok(AppliedResponse {
                applied: store.map_unlock(&name, &req.key, &req.owner).await?,
            })
        })
        .await?;
    Ok(Json(response))
}

// --- Topic ---

async fn handle_topic_publish(
    Extension(server): Extension<Arc<StoreServer>>,
    Path(name): Path<String>,
    Json(req): Json<PublishRequest>,
) -> ApiResult<AckResponse> {
    let store = server.store.clone();
    let response = server
        .once(&req.op_id, || async move {
            store.topic_publish(&name, req.message).await?;
            Ok(AckResponse { success: true })
        })
        .await?;
    Ok(Json(response))
}

// --- Events ---

async fn handle_event_cursor(
    Extension(server): Extension<Arc<StoreServer>>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<CursorResponse> {
    let kind = parse_kind(&kind)?;
    Ok(Json(CursorResponse {
        cursor: server.store.event_cursor(kind, &name).await?,
    }))
}

async fn handle_events(
    Extension(server): Extension<Arc<StoreServer>>,
    Path((kind, name)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<EventsResponse> {
    let kind = parse_kind(&kind)?;
    let wait = Duration::from_millis(query.wait_ms.unwrap_or(0).min(MAX_EVENT_WAIT_MS));
    Ok(Json(
        server
            .store
            .events_since(kind, &name, query.after, wait)
            .await?,
    ))
}

fn parse_kind(kind: &str) -> std::result::Result<StructureKind, StoreApiError> {
    StructureKind::from_str(kind).map_err(|e| StoreApiError(CoordinatorError::Protocol(e)))
}

fn to_key_values(entries: Vec<(String, String)>) -> Vec<KeyValueJson> {
    entries
        .into_iter()
        .map(|(key, value_json)| KeyValueJson { key, value_json })
        .collect()
}
