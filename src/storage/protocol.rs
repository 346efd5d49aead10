//! Store Network Protocol
//!
//! Defines the API endpoints and Data Transfer Objects (DTOs) spoken between
//! `RemoteStore` clients and the shared store server.
//!
//! Values travel as JSON strings (`value_json`, `item`) so the server never
//! needs to know the concrete types stored in a structure. Every mutating
//! request carries an `op_id`; the server replays the cached response for a
//! repeated `op_id`, which makes client-side retries safe for `poll`.

use serde::{Deserialize, Serialize};

use super::types::EventBatch;

// --- API Endpoints ---

pub const ENDPOINT_HEALTH: &str = "/health";
/// Prefix for queue operations: `/queue/:name/<op>`.
pub const ENDPOINT_QUEUE: &str = "/queue";
/// Prefix for map operations: `/map/:name/<op>`.
pub const ENDPOINT_MAP: &str = "/map";
/// Prefix for topic operations: `/topic/:name/<op>`.
pub const ENDPOINT_TOPIC: &str = "/topic";
/// Prefix for event log reads: `/events/:kind/:name`.
pub const ENDPOINT_EVENTS: &str = "/events";

/// Upper bound on how long the server holds an event long-poll open.
pub const MAX_EVENT_WAIT_MS: u64 = 30_000;

// --- Requests ---

/// Bare mutating request (poll, clear).
#[derive(Debug, Serialize, Deserialize)]
pub struct OpRequest {
    pub op_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OfferRequest {
    pub op_id: String,
    pub items: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveItemsRequest {
    pub op_id: String,
    pub items: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveByKeyRequest {
    pub op_id: String,
    pub key: String,
}

/// Atomic queue-head to map transfer.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollIntoRequest {
    pub op_id: String,
    /// Target map name.
    pub map: String,
    /// JSON object merged into the polled item.
    pub patch: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeysRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub op_id: String,
    pub key: String,
    pub value_json: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyOpRequest {
    pub op_id: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompareAndSetRequest {
    pub op_id: String,
    pub key: String,
    /// `None` means "only if absent".
    pub expected: Option<String>,
    /// `None` means "remove".
    pub replacement: Option<String>,
}

/// Atomic map entry to queue transfer (requeue).
#[derive(Debug, Serialize, Deserialize)]
pub struct TransferToQueueRequest {
    pub op_id: String,
    pub key: String,
    pub expected: String,
    /// Target queue name.
    pub queue: String,
    pub item: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub op_id: String,
    pub key: String,
    pub owner: String,
    pub lease_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub op_id: String,
    pub key: String,
    pub owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub op_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsQuery {
    pub after: u64,
    pub wait_ms: Option<u64>,
}

// --- Responses ---

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppliedResponse {
    pub applied: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemResponse {
    pub item: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemsResponse {
    pub items: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SizeResponse {
    pub size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    /// `None` indicates the key does not exist (or did not, for put/remove).
    pub value_json: Option<String>,
}

/// A single key-value pair used in bulk transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueJson {
    pub key: String,
    pub value_json: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntriesResponse {
    pub entries: Vec<KeyValueJson>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferResponse {
    pub entry: Option<KeyValueJson>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CursorResponse {
    pub cursor: u64,
}

pub type EventsResponse = EventBatch;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
