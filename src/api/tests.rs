//! Operator API Tests
//!
//! Drives the router over a real socket with `reqwest`.

#[cfg(test)]
mod tests {
    use crate::api::protocol::*;
    use crate::api::{ApiState, api_router};
    use crate::builds::results::ResultQueueReporter;
    use crate::builds::tracker::BuildJobTracker;
    use crate::builds::types::*;
    use crate::config::{LifecycleConfig, StoreConfig};
    use crate::control::{AGENT_CONTROL_TOPIC, ChaosController, ControlMessage};
    use crate::storage::{DataProvider, MemoryStore};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    struct ApiFixture {
        base_url: String,
        tracker: Arc<BuildJobTracker>,
        provider: Arc<DataProvider>,
    }

    async fn serve() -> ApiFixture {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(DataProvider::new(store, "scheduler", &StoreConfig::default()));
        let reporter = Arc::new(ResultQueueReporter::new(&provider));
        let tracker = BuildJobTracker::new(&provider, reporter, LifecycleConfig::default());
        let controller = Arc::new(ChaosController::new(&provider));
        let app = api_router(ApiState::new(tracker.clone(), controller));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        ApiFixture {
            base_url: format!("http://{}", addr),
            tracker,
            provider,
        }
    }

    fn descriptor(participation_id: u64) -> BuildJobDescriptor {
        BuildJobDescriptor {
            participation_id,
            exercise_id: 3,
            plan_type: BuildPlanType::Student,
        }
    }

    // ============================================================
    // BUILD ENDPOINTS
    // ============================================================

    #[tokio::test]
    async fn test_enqueue_and_list_queued_builds() {
        let fixture = serve().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}{}", fixture.base_url, ENDPOINT_BUILDS))
            .json(&descriptor(11))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: EnqueueResponse = resp.json().await.unwrap();
        assert!(body.accepted);
        let job_id = body.job_id.unwrap();

        let queued: JobsResponse = client
            .get(format!("{}{}", fixture.base_url, ENDPOINT_BUILDS_QUEUED))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(queued.jobs.len(), 1);
        assert_eq!(queued.jobs[0].id, job_id);
        assert_eq!(queued.jobs[0].status, BuildStatus::Queued);
    }

    #[tokio::test]
    async fn test_stats_and_running_builds_follow_claims() {
        let fixture = serve().await;
        let client = reqwest::Client::new();
        fixture.tracker.enqueue(&descriptor(1)).await.unwrap();
        fixture.tracker.enqueue(&descriptor(2)).await.unwrap();
        fixture.tracker.claim("agent-1").await.unwrap().unwrap();

        let stats: StatsResponse = client
            .get(format!("{}{}", fixture.base_url, ENDPOINT_STATS))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.busy_agents, vec!["agent-1".to_string()]);

        let running: JobsResponse = client
            .get(format!("{}{}", fixture.base_url, ENDPOINT_BUILDS_RUNNING))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(running.jobs.len(), 1);
        assert_eq!(running.jobs[0].assigned_agent.as_deref(), Some("agent-1"));
    }

    // ============================================================
    // CONTROL ENDPOINTS
    // ============================================================

    #[tokio::test]
    async fn test_kill_endpoint_publishes_control_message() {
        let fixture = serve().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        fixture
            .provider
            .get_topic::<ControlMessage>(AGENT_CONTROL_TOPIC)
            .add_message_listener(move |message| sink.lock().push(message))
            .await
            .unwrap();

        let resp = reqwest::Client::new()
            .post(format!("{}/agents/agent-4/kill", fixture.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: ControlResponse = resp.json().await.unwrap();
        assert!(body.success);
        assert_eq!(body.agent.as_deref(), Some("agent-4"));

        for _ in 0..50 {
            if !received.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            received.lock().as_slice(),
            &[ControlMessage::KillAgent("agent-4".to_string())]
        );
    }

    #[tokio::test]
    async fn test_kill_endpoint_rejects_invalid_name() {
        let fixture = serve().await;

        let resp = reqwest::Client::new()
            .post(format!("{}/agents/Agent_4/kill", fixture.base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: ControlResponse = resp.json().await.unwrap();
        assert!(!body.success);
        assert!(body.error.is_some());
    }

    #[tokio::test]
    async fn test_kill_random_without_busy_agents_is_not_found() {
        let fixture = serve().await;

        let resp = reqwest::Client::new()
            .post(format!("{}{}", fixture.base_url, ENDPOINT_AGENTS_KILL_RANDOM))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
