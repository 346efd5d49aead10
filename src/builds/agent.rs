//! Build Agent Worker Pool
//!
//! A build agent runs a fixed number of workers that claim jobs from the
//! shared build queue, execute them and report the terminal status.
//!
//! ## Responsibilities
//! - **Claiming**: workers wake on queue item events, with an idle poll as backup.
//! - **Lease Management**: running builds refresh their in-flight entry so the
//!   monitor only requeues jobs of dead or hung agents.
//! - **Control**: reacting to kill, shutdown, pause and resume messages on the
//!   agent control topic.
//!
//! A kill is deliberately ungraceful: running builds are dropped without a
//! report and left for the requeue monitor to recover.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::executor::BuildExecutor;
use super::tracker::BuildJobTracker;
use super::types::*;
use crate::config::{AgentConfig, KillMode};
use crate::control::types::{AGENT_CONTROL_TOPIC, ControlMessage};
use crate::error::Result;
use crate::storage::{DataProvider, ItemEventKind};

/// Exit status of a process-level kill.
pub const KILL_EXIT_CODE: i32 = 137;

pub struct BuildAgent {
    config: AgentConfig,
    provider: Arc<DataProvider>,
    tracker: Arc<BuildJobTracker>,
    executor: Arc<dyn BuildExecutor>,
    /// Woken when a job lands in the queue or the agent is resumed.
    wake: Notify,
    paused: AtomicBool,
    killed: AtomicBool,
    active_builds: AtomicUsize,
    draining: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildAgent {
    pub fn new(
        config: AgentConfig,
        provider: Arc<DataProvider>,
        tracker: Arc<BuildJobTracker>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            tracker,
            executor,
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            active_builds: AtomicUsize::new(0),
            draining: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Subscribes to control messages and queue events, then spawns the
    /// workers. Returns once the agent is accepting work.
    pub async fn start(self: Arc<Self>) -> Result<AgentHandle> {
        let control = self.provider.get_topic::<ControlMessage>(AGENT_CONTROL_TOPIC);
        let agent = self.clone();
        control
            .add_message_listener(move |message| agent.handle_control(message))
            .await?;

        let agent = self.clone();
        self.tracker
            .queue()
            .add_item_listener(move |event| {
                if event.kind == ItemEventKind::Added {
                    agent.wake.notify_one();
                }
            })
            .await?;

        let worker_count = self.config.max_concurrent_builds.max(1);
        tracing::info!(
            "Starting build agent {} with {} workers",
            self.name(),
            worker_count
        );

        let mut workers = self.workers.lock();
        for worker_id in 0..worker_count {
            let agent = self.clone();
            workers.push(tokio::spawn(async move {
                agent.worker_loop(worker_id).await;
            }));
        }
        drop(workers);

        Ok(AgentHandle { agent: self })
    }

    /// The main loop for a single worker.
    ///
    /// 1. Claims the head of the queue (unless paused or draining).
    /// 2. Executes it while keeping its lease fresh.
    /// 3. Otherwise waits for a queue event or the idle poll interval.
    async fn worker_loop(&self, worker_id: usize) {
        tracing::debug!("Worker {} of agent {} started", worker_id, self.name());

        while !self.draining.is_cancelled() {
            if !self.paused.load(Ordering::SeqCst) {
                match self.tracker.claim(self.name()).await {
                    Ok(Some(job)) => {
                        self.execute_with_lease(worker_id, job).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Agent {} failed to claim: {}", self.name(), e),
                }
            }

            tokio::select! {
                _ = self.draining.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::debug!("Worker {} of agent {} stopped", worker_id, self.name());
    }

    /// Runs the build, refreshing the in-flight entry every renewal interval
    /// until it returns, then reports the outcome.
    async fn execute_with_lease(&self, worker_id: usize, job: BuildJob) {
        self.active_builds.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Worker {} of {} building {}", worker_id, self.name(), job.id);

        let build = self.executor.execute(&job);
        tokio::pin!(build);

        let mut renewal = tokio::time::interval(self.config.lease_renewal_interval);
        renewal.tick().await;
        let mut owned = true;

        let result = loop {
            tokio::select! {
                result = &mut build => break result,
                _ = renewal.tick() => {
                    if !owned {
                        continue;
                    }
                    match self.tracker.refresh(&job).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            owned = false;
                            tracing::warn!(
                                "Agent {} no longer owns build {}; finishing it anyway",
                                self.name(),
                                job.id
                            );
                        }
                        Err(e) => tracing::warn!("Failed to refresh lease on build {}: {}", job.id, e),
                    }
                }
            }
        };

        let status = match result {
            Ok(status) if status.is_terminal() => status,
            Ok(status) => {
                tracing::warn!(
                    "Executor returned non-terminal status {} for build {}",
                    status,
                    job.id
                );
                BuildStatus::Error
            }
            Err(e) => {
                tracing::warn!("Build {} failed to execute: {:#}", job.id, e);
                BuildStatus::Error
            }
        };

        if let Err(e) = self.tracker.complete(&job, status).await {
            tracing::error!(
                "Agent {} could not complete build {}: {}",
                self.name(),
                job.id,
                e
            );
        }
        self.active_builds.fetch_sub(1, Ordering::SeqCst);
    }

    /// Control topic callback. Never blocks: anything slow is spawned.
    fn handle_control(self: &Arc<Self>, message: ControlMessage) {
        if !message.targets(self.name()) {
            return;
        }

        match message {
            ControlMessage::KillAgent(_) => self.kill(),
            ControlMessage::ShutdownAllAgents => self.begin_drain(),
            ControlMessage::PauseAgent(_) => {
                self.paused.store(true, Ordering::SeqCst);
                tracing::info!("Agent {} paused", self.name());
            }
            ControlMessage::ResumeAgent(_) => {
                self.paused.store(false, Ordering::SeqCst);
                self.wake.notify_waiters();
                tracing::info!("Agent {} resumed", self.name());
            }
        }
    }

    /// Ungraceful termination. Running builds are abandoned without a report.
    fn kill(&self) {
        tracing::warn!(
            "Agent {} received kill signal, terminating with {} builds in flight",
            self.name(),
            self.active_builds.load(Ordering::SeqCst)
        );

        match self.config.kill_mode {
            KillMode::ExitProcess => std::process::exit(KILL_EXIT_CODE),
            KillMode::AbortTasks => {
                self.killed.store(true, Ordering::SeqCst);
                for worker in self.workers.lock().drain(..) {
                    worker.abort();
                }
                self.draining.cancel();
                self.provider.remove_all_listeners();
            }
        }
    }

    /// Stops claiming; running builds finish and report.
    fn begin_drain(self: &Arc<Self>) {
        if self.draining.is_cancelled() {
            return;
        }
        tracing::info!("Agent {} draining", self.name());
        self.draining.cancel();

        let agent = self.clone();
        tokio::spawn(async move {
            agent.wait_stopped().await;
            agent.provider.remove_all_listeners();
            tracing::info!("Agent {} drained", agent.name());
        });
    }

    /// Resolves once every worker has exited (drained or killed).
    async fn wait_stopped(&self) {
        loop {
            let running = self.workers.lock().iter().any(|w| !w.is_finished());
            if !running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Owner-side view of a started agent.
#[derive(Clone)]
pub struct AgentHandle {
    agent: Arc<BuildAgent>,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        self.agent.name()
    }

    pub fn is_killed(&self) -> bool {
        self.agent.killed.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.agent.paused.load(Ordering::SeqCst)
    }

    pub fn active_builds(&self) -> usize {
        self.agent.active_builds.load(Ordering::SeqCst)
    }

    /// Local graceful drain, same as receiving `ShutdownAllAgents`.
    pub async fn shutdown(&self) {
        self.agent.begin_drain();
        self.wait_stopped().await;
    }

    pub async fn wait_stopped(&self) {
        self.agent.wait_stopped().await;
    }
}
