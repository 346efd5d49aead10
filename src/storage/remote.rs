//! HTTP client backend for a shared store server.
//!
//! ## Responsibilities
//! - Translating `StoreBackend` calls into store-server requests.
//! - Retrying transport failures with backoff. Mutating requests reuse one
//!   `op_id` across attempts so the server applies them at most once.
//! - Reporting an unreachable server as `StoreUnavailable`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use uuid::Uuid;

use super::backend::StoreBackend;
use super::protocol::*;
use super::types::{EventBatch, StructureKind};
use crate::error::{CoordinatorError, Result};

const TRANSPORT_ATTEMPTS: usize = 3;

pub struct RemoteStore {
    base_url: String,
    http_client: reqwest::Client,
    request_timeout: Duration,
}

impl RemoteStore {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True if the server answers its health endpoint.
    pub async fn ping(&self) -> bool {
        match self
            .http_client
            .get(format!("{}{}", self.base_url, ENDPOINT_HEALTH))
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn queue_url(&self, queue: &str, op: &str) -> String {
        format!("{}{}/{}/{}", self.base_url, ENDPOINT_QUEUE, queue, op)
    }

    fn map_url(&self, map: &str, op: &str) -> String {
        format!("{}{}/{}/{}", self.base_url, ENDPOINT_MAP, map, op)
    }

    fn new_op_id() -> String {
        Uuid::new_v4().to_string()
    }

    async fn post<Req, Resp>(&self, url: String, payload: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .post_with_retry(url, payload, self.request_timeout, TRANSPORT_ATTEMPTS)
            .await?;
        decode_response(response).await
    }

    async fn get<Resp: DeserializeOwned>(&self, url: String, timeout: Duration) -> Result<Resp> {
        let response = self
            .get_with_retry(url, timeout, TRANSPORT_ATTEMPTS)
            .await?;
        decode_response(response).await
    }

    // --- HTTP Helpers with Backoff ---

    async fn post_with_retry<T: Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() != StatusCode::SERVICE_UNAVAILABLE => return Ok(resp),
                Ok(resp) if attempt + 1 == attempts => return Ok(resp),
                Err(e) if attempt + 1 == attempts => {
                    return Err(CoordinatorError::StoreUnavailable(e.to_string()));
                }
                _ => {
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(CoordinatorError::StoreUnavailable(
            "Retry attempts exhausted".to_string(),
        ))
    }

    async fn get_with_retry(
        &self,
        url: String,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .get(url.clone())
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() != StatusCode::SERVICE_UNAVAILABLE => return Ok(resp),
                Ok(resp) if attempt + 1 == attempts => return Ok(resp),
                Err(e) if attempt + 1 == attempts => {
                    return Err(CoordinatorError::StoreUnavailable(e.to_string()));
                }
                _ => {
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(CoordinatorError::StoreUnavailable(
            "Retry attempts exhausted".to_string(),
        ))
    }
}

async fn decode_response<Resp: DeserializeOwned>(response: reqwest::Response) -> Result<Resp> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<Resp>()
            .await
            .map_err(|e| CoordinatorError::Protocol(format!("malformed store response: {}", e)));
    }

    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());

    if status == StatusCode::SERVICE_UNAVAILABLE {
        Err(CoordinatorError::StoreUnavailable(message))
    } else {
        Err(CoordinatorError::Protocol(format!("{}: {}", status, message)))
    }
}

fn from_key_values(entries: Vec<KeyValueJson>) -> Vec<(String, String)> {
    entries
        .into_iter()
        .map(|entry| (entry.key, entry.value_json))
        .collect()
}

#[async_trait]
impl StoreBackend for RemoteStore {
    async fn queue_offer(&self, queue: &str, items: Vec<String>) -> Result<()> {
        self.queue_offer_once(queue, &Self::new_op_id(), items).await
    }

    async fn queue_offer_once(&self, queue: &str, op_id: &str, items: Vec<String>) -> Result<()> {
        let req = OfferRequest {
            op_id: op_id.to_string(),
            items,
        };
        let _: AckResponse = self.post(self.queue_url(queue, "offer"), &req).await?;
        Ok(())
    }

    async fn queue_poll(&self, queue: &str) -> Result<Option<String>> {
        let req = OpRequest {
            op_id: Self::new_op_id(),
        };
        let resp: ItemResponse = self.post(self.queue_url(queue, "poll"), &req).await?;
        Ok(resp.item)
    }

    async fn queue_peek(&self, queue: &str) -> Result<Option<String>> {
        let resp: ItemResponse = self
            .get(self.queue_url(queue, "peek"), self.request_timeout)
            .await?;
        Ok(resp.item)
    }

    async fn queue_remove_all(&self, queue: &str, items: Vec<String>) -> Result<bool> {
        let req = RemoveItemsRequest {
            op_id: Self::new_op_id(),
            items,
        };
        let resp: AppliedResponse = self.post(self.queue_url(queue, "remove_all"), &req).await?;
        Ok(resp.applied)
    }

    async fn queue_remove_by_key(&self, queue: &str, key: &str) -> Result<bool> {
        let req = RemoveByKeyRequest {
            op_id: Self::new_op_id(),
            key: key.to_string(),
        };
        let resp: AppliedResponse = self
            .post(self.queue_url(queue, "remove_by_key"), &req)
            .await?;
        Ok(resp.applied)
    }

    async fn queue_items(&self, queue: &str) -> Result<Vec<String>> {
        let resp: ItemsResponse = self
            .get(self.queue_url(queue, "items"), self.request_timeout)
            .await?;
        Ok(resp.items)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        let resp: SizeResponse = self
            .get(self.queue_url(queue, "size"), self.request_timeout)
            .await?;
        Ok(resp.size)
    }

    async fn queue_poll_into_map(
        &self,
        queue: &str,
        map: &str,
        patch: String,
    ) -> Result<Option<(String, String)>> {
        let req = PollIntoRequest {
            op_id: Self::new_op_id(),
            map: map.to_string(),
            patch,
        };
        let resp: TransferResponse = self.post(self.queue_url(queue, "poll_into"), &req).await?;
        Ok(resp.entry.map(|entry| (entry.key, entry.value_json)))
    }

    async fn map_get(&self, map: &str, key: &str) -> Result<Option<String>> {
        let req = KeyRequest {
            key: key.to_string(),
        };
        let resp: ValueResponse = self.post(self.map_url(map, "get"), &req).await?;
        Ok(resp.value_json)
    }

    async fn map_get_all(&self, map: &str, keys: Vec<String>) -> Result<Vec<(String, String)>> {
        let req = KeysRequest { keys };
        let resp: EntriesResponse = self.post(self.map_url(map, "get_all"), &req).await?;
        Ok(from_key_values(resp.entries))
    }

    async fn map_put(&self, map: &str, key: &str, value: String) -> Result<Option<String>> {
        let req = PutRequest {
            op_id: Self::new_op_id(),
            key: key.to_string(),
            value_json: value,
        };
        let resp: ValueResponse = self.post(self.map_url(map, "put"), &req).await?;
        Ok(resp.value_json)
    }

    async fn map_remove(&self, map: &str, key: &str) -> Result<Option<String>> {
        let req = KeyOpRequest {
            op_id: Self::new_op_id(),
            key: key.to_string(),
        };
        let resp: ValueResponse = self.post(self.map_url(map, "remove"), &req).await?;
        Ok(resp.value_json)
    }

    async fn map_compare_and_set(
        &self,
        map: &str,
        key: &str,
        expected: Option<String>,
        replacement: Option<String>,
    ) -> Result<bool> {
        let req = CompareAndSetRequest {
            op_id: Self::new_op_id(),
            key: key.to_string(),
            expected,
            replacement,
        };
        let resp: AppliedResponse = self
            .post(self.map_url(map, "compare_and_set"), &req)
            .await?;
        Ok(resp.applied)
    }

    async fn map_transfer_to_queue(
        &self,
        map: &str,
        key: &str,
        expected: String,
        queue: &str,
        item: String,
    ) -> Result<bool> {
        let req = TransferToQueueRequest {
            op_id: Self::new_op_id(),
            key: key.to_string(),
            expected,
            queue: queue.to_string(),
            item,
        };
        let resp: AppliedResponse = self.post(self.map_url(map, "transfer"), &req).await?;
        Ok(resp.applied)
    }

    async fn map_entries(&self, map: &str) -> Result<Vec<(String, String)>> {
        let resp: EntriesResponse = self
            .get(self.map_url(map, "entries"), self.request_timeout)
            .await?;
        Ok(from_key_values(resp.entries))
    }

    async fn map_len(&self, map: &str) -> Result<usize> {
        let resp: SizeResponse = self
            .get(self.map_url(map, "size"), self.request_timeout)
            .await?;
        Ok(resp.size)
    }

    async fn map_clear(&self, map: &str) -> Result<()> {
        let req = OpRequest {
            op_id: Self::new_op_id(),
        };
        let _: AckResponse = self.post(self.map_url(map, "clear"), &req).await?;
        Ok(())
    }

    async fn map_try_lock(
        &self,
        map: &str,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool> {
        let req = LockRequest {
            op_id: Self::new_op_id(),
            key: key.to_string(),
            owner: owner.to_string(),
            lease_ms: lease.as_millis() as u64,
        };
        let resp: AppliedResponse = self.post(self.map_url(map, "lock"), &req).await?;
        Ok(resp.applied)
    }

    async fn map_unlock(&self, map: &str, key: &str, owner: &str) -> Result<bool> {
        let req = UnlockRequest {
            op_id: Self::new_op_id(),
            key: key.to_string(),
            owner: owner.to_string(),
        };
        let resp: AppliedResponse = self.post(self.map_url(map, "unlock"), &req).await?;
        Ok(resp.applied)
    }

    async fn topic_publish(&self, topic: &str, message: String) -> Result<()> {
        let req = PublishRequest {
            op_id: Self::new_op_id(),
            message,
        };
        let url = format!("{}{}/{}/publish", self.base_url, ENDPOINT_TOPIC, topic);
        let _: AckResponse = self.post(url, &req).await?;
        Ok(())
    }

    async fn event_cursor(&self, kind: StructureKind, name: &str) -> Result<u64> {
        let url = format!("{}{}/{}/{}/cursor", self.base_url, ENDPOINT_EVENTS, kind, name);
        let resp: CursorResponse = self.get(url, self.request_timeout).await?;
        Ok(resp.cursor)
    }

    async fn events_since(
        &self,
        kind: StructureKind,
        name: &str,
        after: u64,
        wait: Duration,
    ) -> Result<EventBatch> {
        let wait_ms = (wait.as_millis() as u64).min(MAX_EVENT_WAIT_MS);
        let url = format!(
            "{}{}/{}/{}?after={}&wait_ms={}",
            self.base_url, ENDPOINT_EVENTS, kind, name, after, wait_ms
        );
        // The server holds the request open for up to `wait`.
        let timeout = Duration::from_millis(wait_ms) + self.request_timeout;
        self.get(url, timeout).await
    }
}
