use axum::Router;
use build_coordinator::api::{ApiState, api_router};
use build_coordinator::builds::{
    BuildAgent, BuildJobTracker, RequeueMonitor, ResultQueueReporter, SimulatedBuildExecutor,
};
use build_coordinator::config::{
    AgentConfig, BackendKind, CoordinatorConfig, KillMode, LifecycleConfig,
};
use build_coordinator::control::ChaosController;
use build_coordinator::storage::DataProvider;
use build_coordinator::storage::handlers::{StoreServer, store_router};
use build_coordinator::storage::memory::DEFAULT_EVENT_CAPACITY;
use build_coordinator::storage::{MemoryStore, RemoteStore};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "build-coordinator", about = "CI build fleet coordination")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the shared queue/map/topic store.
    Store {
        #[arg(long, default_value = "127.0.0.1:7000")]
        bind: SocketAddr,
        /// Events kept per structure for lagging listeners.
        #[arg(long, env = "BUILD_EVENT_CAPACITY", default_value_t = DEFAULT_EVENT_CAPACITY)]
        event_capacity: usize,
    },
    /// Run the requeue monitor and the operator API against a store server.
    Scheduler {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
        #[arg(long, env = "BUILD_STORE_URL")]
        store_url: String,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        lifecycle: LifecycleArgs,
    },
    /// Run one build agent against a store server.
    Agent {
        #[arg(long, env = "BUILD_AGENT_NAME")]
        name: String,
        #[arg(long, env = "BUILD_STORE_URL")]
        store_url: String,
        #[command(flatten)]
        store: StoreArgs,
        /// Must match the scheduler's, so lease renewal is checked against it.
        #[command(flatten)]
        lifecycle: LifecycleArgs,
        #[command(flatten)]
        agent: AgentArgs,
    },
    /// Store, scheduler, API and several agents in one process.
    Standalone {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
        #[arg(long, default_value_t = 3)]
        agents: usize,
        #[arg(long, env = "BUILD_EVENT_CAPACITY", default_value_t = DEFAULT_EVENT_CAPACITY)]
        event_capacity: usize,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        lifecycle: LifecycleArgs,
        #[command(flatten)]
        agent: AgentArgs,
    },
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// How long a key lock is waited for before `LockTimeout`.
    #[arg(long, env = "BUILD_LOCK_TIMEOUT_MS", default_value_t = 5_000)]
    lock_timeout_ms: u64,
    /// How long a granted key lock survives without unlock.
    #[arg(long, env = "BUILD_LOCK_LEASE_MS", default_value_t = 10_000)]
    lock_lease_ms: u64,
    #[arg(long, env = "BUILD_REQUEST_TIMEOUT_MS", default_value_t = 500)]
    request_timeout_ms: u64,
}

impl StoreArgs {
    fn apply(&self, config: CoordinatorConfig) -> CoordinatorConfig {
        config
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_lock_lease(Duration::from_millis(self.lock_lease_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Args, Debug)]
struct LifecycleArgs {
    #[arg(long, env = "BUILD_CLAIM_TIMEOUT_SECS", default_value_t = 30)]
    claim_timeout_secs: u64,
    #[arg(long, env = "BUILD_MONITOR_INTERVAL_SECS", default_value_t = 5)]
    monitor_interval_secs: u64,
    #[arg(long, env = "BUILD_MAX_REQUEUE_ATTEMPTS", default_value_t = 3)]
    max_requeue_attempts: u32,
}

impl LifecycleArgs {
    fn apply(&self, config: CoordinatorConfig) -> CoordinatorConfig {
        config
            .with_claim_timeout(Duration::from_secs(self.claim_timeout_secs))
            .with_monitor_interval(Duration::from_secs(self.monitor_interval_secs))
            .with_max_requeue_attempts(self.max_requeue_attempts)
    }
}

#[derive(Args, Debug)]
struct AgentArgs {
    #[arg(long, default_value_t = 2)]
    max_builds: usize,
    #[arg(long, default_value_t = 10)]
    lease_renewal_secs: u64,
    #[arg(long, default_value_t = 2000)]
    min_build_ms: u64,
    #[arg(long, default_value_t = 8000)]
    max_build_ms: u64,
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,
}

impl AgentArgs {
    fn agent_config(&self, name: &str, kill_mode: KillMode) -> AgentConfig {
        AgentConfig::new(name)
            .with_max_concurrent_builds(self.max_builds)
            .with_lease_renewal_interval(Duration::from_secs(self.lease_renewal_secs))
            .with_kill_mode(kill_mode)
    }

    fn executor(&self) -> Arc<SimulatedBuildExecutor> {
        Arc::new(SimulatedBuildExecutor::new(
            Duration::from_millis(self.min_build_ms),
            Duration::from_millis(self.max_build_ms),
            self.failure_rate,
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Store {
            bind,
            event_capacity,
        } => run_store(bind, event_capacity).await,
        Command::Scheduler {
            bind,
            store_url,
            store,
            lifecycle,
        } => {
            let config = remote_config(store_url, &store, &lifecycle);
            config.validate()?;
            let provider = Arc::new(DataProvider::from_config("scheduler", &config.store));
            wait_for_store(&provider, &config).await;
            run_scheduler(bind, provider, config.lifecycle).await
        }
        Command::Agent {
            name,
            store_url,
            store,
            lifecycle,
            agent,
        } => {
            let config = remote_config(store_url, &store, &lifecycle)
                .with_agent(agent.agent_config(&name, KillMode::ExitProcess));
            config.validate()?;
            let provider = Arc::new(DataProvider::from_config(&name, &config.store));
            wait_for_store(&provider, &config).await;
            run_agent(provider, config, &agent).await
        }
        Command::Standalone {
            bind,
            agents,
            event_capacity,
            store,
            lifecycle,
            agent,
        } => {
            let base = lifecycle
                .apply(store.apply(CoordinatorConfig::default()))
                .with_event_capacity(event_capacity);
            run_standalone(bind, agents, base, agent).await
        }
    }
}

/// Settings for a process that reaches the store server over HTTP.
fn remote_config(store_url: String, store: &StoreArgs, lifecycle: &LifecycleArgs) -> CoordinatorConfig {
    lifecycle
        .apply(store.apply(CoordinatorConfig::default()))
        .with_backend(BackendKind::Remote { url: store_url })
}

async fn run_store(bind: SocketAddr, event_capacity: usize) -> anyhow::Result<()> {
    if event_capacity == 0 {
        anyhow::bail!("event capacity must be at least 1");
    }
    let server = StoreServer::new(Arc::new(MemoryStore::with_event_capacity(event_capacity)));
    let app = store_router(server);

    tracing::info!("Store server listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_scheduler(
    bind: SocketAddr,
    provider: Arc<DataProvider>,
    lifecycle: LifecycleConfig,
) -> anyhow::Result<()> {
    let reporter = Arc::new(ResultQueueReporter::new(&provider));
    let tracker = BuildJobTracker::new(&provider, reporter, lifecycle);
    let controller = Arc::new(ChaosController::new(&provider));

    let shutdown = CancellationToken::new();
    let monitor = RequeueMonitor::new(tracker.clone()).start(shutdown.clone());

    let app = api_router(ApiState::new(tracker, controller));
    serve_until_ctrl_c(bind, app, "Scheduler API").await?;

    shutdown.cancel();
    let _ = monitor.await;
    Ok(())
}

async fn run_agent(
    provider: Arc<DataProvider>,
    config: CoordinatorConfig,
    args: &AgentArgs,
) -> anyhow::Result<()> {
    let reporter = Arc::new(ResultQueueReporter::new(&provider));
    let tracker = BuildJobTracker::new(&provider, reporter, config.lifecycle);
    let handle = BuildAgent::new(config.agent, provider, tracker, args.executor())
        .start()
        .await?;

    tokio::select! {
        _ = handle.wait_stopped() => {
            tracing::info!("Agent {} stopped", handle.name());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, draining agent {}", handle.name());
            handle.shutdown().await;
        }
    }
    Ok(())
}

async fn run_standalone(
    bind: SocketAddr,
    agent_count: usize,
    base: CoordinatorConfig,
    agent_args: AgentArgs,
) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::with_event_capacity(base.store.event_capacity));

    let mut handles = Vec::with_capacity(agent_count);
    for i in 1..=agent_count {
        let name = format!("build-agent-{}", i);
        let config = base
            .clone()
            .with_agent(agent_args.agent_config(&name, KillMode::AbortTasks));
        config.validate()?;

        let provider = Arc::new(DataProvider::new(store.clone(), &name, &config.store));
        let reporter = Arc::new(ResultQueueReporter::new(&provider));
        let tracker = BuildJobTracker::new(&provider, reporter, config.lifecycle.clone());
        let handle = BuildAgent::new(config.agent, provider, tracker, agent_args.executor())
            .start()
            .await?;
        handles.push(handle);
    }

    let provider = Arc::new(DataProvider::new(store, "scheduler", &base.store));
    let result = run_scheduler(bind, provider, base.lifecycle).await;

    for handle in &handles {
        if !handle.is_killed() {
            handle.shutdown().await;
        }
    }
    result
}

async fn serve_until_ctrl_c(bind: SocketAddr, app: Router, label: &str) -> anyhow::Result<()> {
    tracing::info!("{} listening on {}", label, bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Ctrl-C received, shutting down");
        })
        .await?;
    Ok(())
}

/// Blocks until the store server answers, logging while it is unreachable.
async fn wait_for_store(provider: &DataProvider, config: &CoordinatorConfig) {
    let BackendKind::Remote { url } = &config.store.backend else {
        return;
    };
    let client = RemoteStore::new(url, config.store.request_timeout);
    let mut attempt = 0u32;
    while !client.ping().await {
        attempt += 1;
        if attempt % 10 == 1 {
            tracing::warn!(
                "Store server {} unreachable from {}, waiting...",
                client.base_url(),
                provider.member()
            );
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    tracing::info!("Connected to store server {}", client.base_url());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        let argv = std::iter::once("build-coordinator").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn scheduler_maps_store_arguments() {
        let Command::Scheduler {
            store_url,
            store,
            lifecycle,
            ..
        } = parse(&[
            "scheduler",
            "--store-url",
            "http://127.0.0.1:7000",
            "--lock-timeout-ms",
            "750",
            "--lock-lease-ms",
            "2000",
            "--request-timeout-ms",
            "300",
        ])
        else {
            panic!("expected the scheduler subcommand");
        };

        let config = remote_config(store_url, &store, &lifecycle);

        assert_eq!(config.store.lock_timeout, Duration::from_millis(750));
        assert_eq!(config.store.lock_lease, Duration::from_millis(2000));
        assert_eq!(config.store.request_timeout, Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn agent_renewal_is_checked_against_its_claim_timeout() {
        let Command::Agent {
            name,
            store_url,
            store,
            lifecycle,
            agent,
        } = parse(&[
            "agent",
            "--name",
            "agent-1",
            "--store-url",
            "http://127.0.0.1:7000",
            "--claim-timeout-secs",
            "8",
            "--lease-renewal-secs",
            "10",
        ])
        else {
            panic!("expected the agent subcommand");
        };

        let config = remote_config(store_url, &store, &lifecycle)
            .with_agent(agent.agent_config(&name, KillMode::ExitProcess));

        assert_eq!(config.lifecycle.claim_timeout, Duration::from_secs(8));
        assert!(matches!(
            config.validate(),
            Err(build_coordinator::error::CoordinatorError::Config(_))
        ));
    }
}
