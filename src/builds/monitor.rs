//! Orphan recovery.
//!
//! Periodically scans the in-flight map for `RUNNING` entries that have not
//! been refreshed within the claim timeout (their agent died or hung) and
//! either returns them to the queue or, once the requeue budget is spent,
//! forces them to `ERROR` as poison jobs.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::tracker::BuildJobTracker;
use super::types::*;
use crate::error::{CoordinatorError, Result};
use crate::storage::types::now_ms;

/// What one pass over the in-flight map did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub requeued: Vec<BuildJobId>,
    pub poisoned: Vec<BuildJobId>,
    /// Stale entries left for the next pass (lock busy, refreshed meanwhile,
    /// or a poison record that could not be handed off).
    pub skipped: usize,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.poisoned.is_empty() && self.skipped == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Requeued,
    Poisoned,
    Skipped,
}

pub struct RequeueMonitor {
    tracker: Arc<BuildJobTracker>,
    claim_timeout: Duration,
    max_requeue_attempts: u32,
    interval: Duration,
}

impl RequeueMonitor {
    pub fn new(tracker: Arc<BuildJobTracker>) -> Arc<Self> {
        let lifecycle = tracker.lifecycle().clone();
        Arc::new(Self {
            tracker,
            claim_timeout: lifecycle.claim_timeout,
            max_requeue_attempts: lifecycle.max_requeue_attempts,
            interval: lifecycle.monitor_interval,
        })
    }

    /// Spawns the scan loop. It stops when `shutdown` is cancelled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            "Requeue monitor started (claim timeout {:?}, every {:?}, max {} requeues)",
            self.claim_timeout,
            self.interval,
            self.max_requeue_attempts
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Requeue monitor stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.scan().await {
                Ok(report) if !report.is_empty() => tracing::info!(
                    "Monitor pass: {} requeued, {} poisoned, {} deferred",
                    report.requeued.len(),
                    report.poisoned.len(),
                    report.skipped
                ),
                Ok(_) => tracing::trace!("Monitor pass: nothing stale"),
                Err(e) => tracing::warn!("Monitor pass failed: {}", e),
            }
        }
    }

    /// One pass over the in-flight map.
    pub async fn scan(&self) -> Result<ScanReport> {
        let now = now_ms();
        let mut report = ScanReport::default();

        for (id, job) in self.tracker.processing().entry_set().await? {
            if !job.is_stale(now, self.claim_timeout) {
                continue;
            }

            let orphan = CoordinatorError::OrphanedJob {
                job_id: id.to_string(),
                agent: job.assigned_agent.clone().unwrap_or_default(),
                stale_for: job.stale_for(now),
            };
            tracing::warn!("{}", orphan);

            match self.recover(&id).await {
                Ok(Recovery::Requeued) => report.requeued.push(id),
                Ok(Recovery::Poisoned) => report.poisoned.push(id),
                Ok(Recovery::Skipped) => report.skipped += 1,
                Err(e @ CoordinatorError::LockTimeout { .. }) => {
                    tracing::debug!("Deferring build {}: {}", id, e);
                    report.skipped += 1;
                }
                Err(e @ CoordinatorError::ReportFailed { .. }) => {
                    tracing::error!("Leaving build {} in flight for the next pass: {}", id, e);
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn recover(&self, id: &BuildJobId) -> Result<Recovery> {
        let processing = self.tracker.processing();
        processing.lock(id).await?;
        let result = self.recover_locked(id).await;
        self.tracker.release(id).await;
        result
    }

    async fn recover_locked(&self, id: &BuildJobId) -> Result<Recovery> {
        let processing = self.tracker.processing();
        let now = now_ms();

        // Re-read under the lock: the agent may have refreshed or completed.
        let Some(current) = processing.get(id).await? else {
            return Ok(Recovery::Skipped);
        };
        if !current.is_stale(now, self.claim_timeout) {
            return Ok(Recovery::Skipped);
        }

        if current.requeue_count >= self.max_requeue_attempts {
            // The entry is only removed once its ERROR record has been handed off.
            self.report_poison(&current).await?;
            let removed = processing.compare_and_set(id, Some(&current), None).await?;
            if !removed {
                tracing::warn!("Poisoned build {} changed under its lock after reporting", id);
            }
            return Ok(Recovery::Poisoned);
        }

        let requeued = current.requeued(now)?;
        let moved = processing
            .transfer_to_queue(id, &current, self.tracker.queue(), &requeued)
            .await?;

        if moved {
            tracing::info!(
                "Requeued build {} from {} (requeue {}/{})",
                id,
                current.assigned_agent.as_deref().unwrap_or("unknown agent"),
                requeued.requeue_count,
                self.max_requeue_attempts
            );
            Ok(Recovery::Requeued)
        } else {
            Ok(Recovery::Skipped)
        }
    }

    async fn report_poison(&self, job: &BuildJob) -> Result<()> {
        let poison = CoordinatorError::PoisonJob {
            job_id: job.id.to_string(),
            attempts: job.requeue_count,
        };
        tracing::error!("{}; forcing status ERROR", poison);

        let record = TerminalRecord::from_job(job, BuildStatus::Error, TerminalCause::PoisonJob, now_ms());
        self.tracker.report(&record).await
    }
}
