//! Control Path Tests
//!
//! ## Test Scopes
//! - **Messages**: wire format and targeting.
//! - **Controller**: kill, pause/resume, shutdown and random kill against live agents.

#[cfg(test)]
mod tests {
    use crate::builds::executor::FnBuildExecutor;
    use crate::builds::results::ResultQueueReporter;
    use crate::builds::tracker::BuildJobTracker;
    use crate::builds::types::*;
    use crate::builds::{AgentHandle, BuildAgent};
    use crate::config::{AgentConfig, KillMode, LifecycleConfig, StoreConfig};
    use crate::control::{ChaosController, ControlMessage};
    use crate::error::CoordinatorError;
    use crate::storage::{DataProvider, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn node(store: &Arc<MemoryStore>, member: &str) -> Arc<DataProvider> {
        Arc::new(DataProvider::new(store.clone(), member, &StoreConfig::default()))
    }

    fn tracker_for(provider: &DataProvider) -> Arc<BuildJobTracker> {
        let reporter = Arc::new(ResultQueueReporter::new(provider));
        BuildJobTracker::new(provider, reporter, LifecycleConfig::default())
    }

    async fn start_agent(store: &Arc<MemoryStore>, name: &str, build_time: Duration) -> AgentHandle {
        let provider = node(store, name);
        let tracker = tracker_for(&provider);
        let executor = FnBuildExecutor::new(move |_job: BuildJob| async move {
            tokio::time::sleep(build_time).await;
            Ok(BuildStatus::Successful)
        });
        let config = AgentConfig::new(name)
            .with_kill_mode(KillMode::AbortTasks)
            .with_poll_interval(Duration::from_millis(50));
        BuildAgent::new(config, provider, tracker, executor)
            .start()
            .await
            .unwrap()
    }

    async fn wait_until(cond: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    fn descriptor() -> BuildJobDescriptor {
        BuildJobDescriptor {
            participation_id: 1,
            exercise_id: 1,
            plan_type: BuildPlanType::Solution,
        }
    }

    // ============================================================
    // MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_control_message_wire_format() {
        let kill = serde_json::to_value(ControlMessage::KillAgent("agent-1".into())).unwrap();
        assert_eq!(kill, serde_json::json!({ "type": "KILL_AGENT", "agent": "agent-1" }));

        let shutdown: ControlMessage =
            serde_json::from_str(r#"{"type":"SHUTDOWN_ALL_AGENTS"}"#).unwrap();
        assert_eq!(shutdown, ControlMessage::ShutdownAllAgents);
    }

    #[test]
    fn test_control_message_targets() {
        assert!(ControlMessage::KillAgent("a".into()).targets("a"));
        assert!(!ControlMessage::KillAgent("a".into()).targets("b"));
        assert!(ControlMessage::ShutdownAllAgents.targets("anyone"));
        assert!(!ControlMessage::PauseAgent("a".into()).targets("ab"));
    }

    // ============================================================
    // CONTROLLER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_kill_rejects_malformed_agent_name() {
        let store = Arc::new(MemoryStore::new());
        let controller = ChaosController::new(&node(&store, "operator"));

        let result = controller.trigger_kill_agent("Agent One").await;

        assert!(matches!(result, Err(CoordinatorError::Config(_))));
    }

    #[tokio::test]
    async fn test_kill_only_hits_named_agent() {
        let store = Arc::new(MemoryStore::new());
        let victim = start_agent(&store, "agent-1", Duration::from_millis(10)).await;
        let survivor = start_agent(&store, "agent-2", Duration::from_millis(10)).await;
        let controller = ChaosController::new(&node(&store, "operator"));

        controller.trigger_kill_agent("agent-1").await.unwrap();

        assert!(wait_until(|| victim.is_killed()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!survivor.is_killed());
        survivor.shutdown().await;
    }

    #[tokio::test]
    async fn test_killed_agent_leaves_running_job_in_flight() {
        // ARRANGE: a build long enough to be caught mid-run
        let store = Arc::new(MemoryStore::new());
        let scheduler = node(&store, "scheduler");
        let tracker = tracker_for(&scheduler);
        let agent = start_agent(&store, "agent-1", Duration::from_secs(60)).await;
        tracker.enqueue(&descriptor()).await.unwrap();
        assert!(wait_until(|| agent.active_builds() == 1).await);

        // ACT
        let controller = ChaosController::new(&scheduler);
        controller.trigger_kill_agent("agent-1").await.unwrap();
        assert!(wait_until(|| agent.is_killed()).await);

        // ASSERT: the kill path does not touch the map
        let running = tracker.running_jobs().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].assigned_agent.as_deref(), Some("agent-1"));
        assert_eq!(running[0].status, BuildStatus::Running);
    }

    #[tokio::test]
    async fn test_pause_stops_claiming_until_resumed() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = node(&store, "scheduler");
        let tracker = tracker_for(&scheduler);
        let agent = start_agent(&store, "agent-1", Duration::from_millis(10)).await;
        let controller = ChaosController::new(&scheduler);

        controller.pause_agent("agent-1").await.unwrap();
        assert!(wait_until(|| agent.is_paused()).await);
        tracker.enqueue(&descriptor()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.queue_depth().await.unwrap(), 1, "paused agent must not claim");

        controller.resume_agent("agent-1").await.unwrap();
        let mut drained = false;
        for _ in 0..100 {
            if tracker.queue_depth().await.unwrap() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drained);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_all_drains_every_agent() {
        let store = Arc::new(MemoryStore::new());
        let first = start_agent(&store, "agent-1", Duration::from_millis(10)).await;
        let second = start_agent(&store, "agent-2", Duration::from_millis(10)).await;
        let controller = ChaosController::new(&node(&store, "operator"));

        controller.shutdown_all_agents().await.unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            first.wait_stopped().await;
            second.wait_stopped().await;
        })
        .await;
        assert!(stopped.is_ok());
        assert!(!first.is_killed(), "shutdown is not a kill");
    }

    #[tokio::test]
    async fn test_kill_random_agent_picks_a_busy_agent() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = node(&store, "scheduler");
        let tracker = tracker_for(&scheduler);
        let controller = ChaosController::new(&scheduler);

        assert_eq!(controller.kill_random_agent().await.unwrap(), None);

        tracker.enqueue(&descriptor()).await.unwrap();
        tracker.claim("agent-7").await.unwrap().unwrap();

        assert_eq!(controller.busy_agents().await.unwrap(), vec!["agent-7"]);
        assert_eq!(
            controller.kill_random_agent().await.unwrap().as_deref(),
            Some("agent-7")
        );
    }
}
