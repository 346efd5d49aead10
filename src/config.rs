use std::time::Duration;

use crate::error::{CoordinatorError, Result};
use crate::storage::memory::DEFAULT_EVENT_CAPACITY;

/// Which store backs the distributed queue, map and topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Single-process store. Every component in the process shares it.
    Memory,
    /// Shared store server reached over HTTP (multi-node deployment).
    Remote { url: String },
}

/// Settings for the distributed primitives.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// How long `lock(key)` waits before failing with `LockTimeout`.
    pub lock_timeout: Duration,
    /// How long a granted lock survives without `unlock`. Bounds the damage
    /// of a holder that dies while holding it.
    pub lock_lease: Duration,
    /// Per-request timeout for the remote backend.
    pub request_timeout: Duration,
    /// Events an in-process store keeps per structure. A listener that falls
    /// further behind than this misses the overflow (logged as skipped).
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            lock_timeout: Duration::from_secs(5),
            lock_lease: Duration::from_secs(10),
            request_timeout: Duration::from_millis(500),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Settings for build-job tracking and orphan recovery.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a `RUNNING` entry may go unrefreshed before it is requeued.
    pub claim_timeout: Duration,
    /// How often the monitor scans the in-flight map.
    pub monitor_interval: Duration,
    /// Requeues allowed before a job is forced to `ERROR`.
    pub max_requeue_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
            max_requeue_attempts: 3,
        }
    }
}

/// What an agent does when it receives a kill message addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Terminate the whole process immediately.
    ExitProcess,
    /// Abort every task the agent owns without cleanup. Used when several
    /// agents share one process (tests, single-node mode).
    AbortTasks,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub max_concurrent_builds: usize,
    /// Backup poll interval while idle; queue listeners wake workers earlier.
    pub poll_interval: Duration,
    /// How often a running build refreshes its in-flight entry.
    pub lease_renewal_interval: Duration,
    pub kill_mode: KillMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "build-agent-1".to_string(),
            max_concurrent_builds: 2,
            poll_interval: Duration::from_secs(1),
            lease_renewal_interval: Duration::from_secs(10),
            kill_mode: KillMode::ExitProcess,
        }
    }
}

impl AgentConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrent_builds(mut self, builds: usize) -> Self {
        self.max_concurrent_builds = builds;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_renewal_interval(mut self, interval: Duration) -> Self {
        self.lease_renewal_interval = interval;
        self
    }

    pub fn with_kill_mode(mut self, mode: KillMode) -> Self {
        self.kill_mode = mode;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub store: StoreConfig,
    pub lifecycle: LifecycleConfig,
    pub agent: AgentConfig,
}

impl CoordinatorConfig {
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.store.backend = backend;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle.claim_timeout = timeout;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.lifecycle.monitor_interval = interval;
        self
    }

    pub fn with_max_requeue_attempts(mut self, attempts: u32) -> Self {
        self.lifecycle.max_requeue_attempts = attempts;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.store.lock_timeout = timeout;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.store.lock_lease = lease;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.store.request_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.store.event_capacity = capacity;
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    /// Rejects settings that would make a wait unbounded or an identity ambiguous.
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("lock_timeout", self.store.lock_timeout),
            ("lock_lease", self.store.lock_lease),
            ("request_timeout", self.store.request_timeout),
            ("claim_timeout", self.lifecycle.claim_timeout),
            ("monitor_interval", self.lifecycle.monitor_interval),
            ("poll_interval", self.agent.poll_interval),
            ("lease_renewal_interval", self.agent.lease_renewal_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(CoordinatorError::Config(format!("{} must be non-zero", name)));
            }
        }

        if let BackendKind::Remote { url } = &self.store.backend {
            if url.trim().is_empty() {
                return Err(CoordinatorError::Config(
                    "remote backend requires a store url".to_string(),
                ));
            }
        }

        if self.agent.lease_renewal_interval >= self.lifecycle.claim_timeout {
            return Err(CoordinatorError::Config(
                "lease_renewal_interval must be shorter than claim_timeout".to_string(),
            ));
        }

        if self.store.event_capacity == 0 {
            return Err(CoordinatorError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }

        if self.agent.max_concurrent_builds == 0 {
            return Err(CoordinatorError::Config(
                "max_concurrent_builds must be at least 1".to_string(),
            ));
        }

        validate_agent_name(&self.agent.name)
    }
}

/// Agent names double as topic correlation keys and must stay URL-safe.
pub fn validate_agent_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CoordinatorError::Config(format!(
            "agent name '{}' must only contain lowercase letters, numbers and hyphens",
            name
        )))
    }
}
