//! Build-job lifecycle tracker.
//!
//! Owns every state transition of a build job:
//!
//! ```text
//! enqueue ──> QUEUED ──claim──> RUNNING ──complete──> SUCCESSFUL | FAILED | ERROR | CANCELLED
//!                ^                 │
//!                └────requeue──────┘   (monitor, when the entry goes stale)
//! ```
//!
//! ## Responsibilities
//! - **Enqueue**: producer-side entry point onto the build queue.
//! - **Claim**: atomic queue -> in-flight map move, stamped with the agent and a fresh claim id.
//! - **Refresh**: lease renewal so the monitor leaves live builds alone.
//! - **Complete**: terminal report, resolved against concurrent requeues.
//!
//! Transitions on an in-flight entry take the entry's key lock and compare
//! the whole value (claim id and version included) before writing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::results::ResultReporter;
use super::types::*;
use crate::config::LifecycleConfig;
use crate::error::{CoordinatorError, Result};
use crate::retry::{DEFAULT_ATTEMPTS, retry_collaborator, retry_with_backoff};
use crate::storage::types::now_ms;
use crate::storage::{DataProvider, DistributedMap, DistributedQueue};

pub const BUILD_JOB_QUEUE: &str = "build-job-queue";
pub const PROCESSING_JOBS: &str = "processing-jobs";

pub struct BuildJobTracker {
    queue: DistributedQueue<BuildJob>,
    processing: DistributedMap<BuildJobId, BuildJob>,
    reporter: Arc<dyn ResultReporter>,
    lifecycle: LifecycleConfig,
}

impl BuildJobTracker {
    pub fn new(
        provider: &DataProvider,
        reporter: Arc<dyn ResultReporter>,
        lifecycle: LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: provider.get_queue(BUILD_JOB_QUEUE),
            processing: provider.get_map(PROCESSING_JOBS),
            reporter,
            lifecycle,
        })
    }

    pub fn queue(&self) -> &DistributedQueue<BuildJob> {
        &self.queue
    }

    pub fn processing(&self) -> &DistributedMap<BuildJobId, BuildJob> {
        &self.processing
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    /// Queues a new build and returns its id.
    ///
    /// Every attempt carries the same op id, so the store appends the job at
    /// most once even when an earlier attempt's outcome was unknown.
    pub async fn enqueue(&self, descriptor: &BuildJobDescriptor) -> Result<BuildJobId> {
        let job = BuildJob::queued(descriptor, now_ms());
        let op_id = format!("enqueue-{}", job.id);

        retry_with_backoff("enqueue", DEFAULT_ATTEMPTS, || {
            let (job, op_id) = (&job, &op_id);
            async move { self.queue.add_once(job, op_id).await }
        })
        .await?;

        tracing::info!(
            "Enqueued build {} (participation {}, {:?})",
            job.id,
            job.participation_id,
            job.plan_type
        );
        Ok(job.id)
    }

    /// Takes the head of the queue for `agent`, or `None` if the queue is empty.
    ///
    /// The job leaves the queue and enters the in-flight map as `RUNNING` in
    /// one store operation. Retries reuse the claim id, so an attempt that
    /// succeeded remotely but reported an error is picked up rather than
    /// orphaned.
    pub async fn claim(&self, agent: &str) -> Result<Option<BuildJob>> {
        let patch = ClaimPatch::new(agent, now_ms());
        let attempted = AtomicBool::new(false);

        let claimed = retry_with_backoff("claim", DEFAULT_ATTEMPTS, || {
            let (patch, attempted) = (&patch, &attempted);
            async move {
                if attempted.swap(true, Ordering::SeqCst) {
                    if let Some(job) = self.find_claim(&patch.claim_id).await? {
                        return Ok(Some(job));
                    }
                }
                self.queue.poll_into(&self.processing, patch).await
            }
        })
        .await?;

        if let Some(job) = &claimed {
            tracing::info!(
                "Agent {} claimed build {} (attempt {})",
                agent,
                job.id,
                job.requeue_count + 1
            );
        }
        Ok(claimed)
    }

    /// Renews the lease on a running build.
    ///
    /// Returns the refreshed entry, or `None` if the claim no longer owns the
    /// job (it was requeued or completed elsewhere).
    pub async fn refresh(&self, job: &BuildJob) -> Result<Option<BuildJob>> {
        self.processing.lock(&job.id).await?;
        let result = self.refresh_locked(job).await;
        self.release(&job.id).await;
        result
    }

    async fn refresh_locked(&self, job: &BuildJob) -> Result<Option<BuildJob>> {
        let Some(current) = self.processing.get(&job.id).await? else {
            return Ok(None);
        };
        if current.claim_id != job.claim_id {
            return Ok(None);
        }

        let refreshed = current.refreshed(now_ms());
        let applied = self
            .processing
            .compare_and_set(&job.id, Some(&current), Some(&refreshed))
            .await?;

        if applied {
            tracing::trace!("Refreshed lease on build {}", job.id);
            Ok(Some(refreshed))
        } else {
            Ok(None)
        }
    }

    /// Reports the terminal `status` of a claimed build.
    ///
    /// Resolution against a concurrent requeue:
    /// - entry still held by this claim: result reported, then entry removed;
    /// - entry re-claimed by another agent: this report is discarded;
    /// - entry requeued but not yet re-claimed: pulled back out of the queue
    ///   and reported, so the terminal report wins.
    ///
    /// If the result cannot be handed off (`ReportFailed`), the job stays
    /// recoverable: in flight for the monitor, or back on the queue.
    pub async fn complete(&self, job: &BuildJob, status: BuildStatus) -> Result<CompletionOutcome> {
        if !status.is_terminal() {
            return Err(CoordinatorError::InvalidTransition {
                from: BuildStatus::Running.to_string(),
                to: status.to_string(),
            });
        }

        let record = TerminalRecord::from_job(job, status, TerminalCause::Reported, now_ms());
        let reported = AtomicBool::new(false);
        let outcome = retry_with_backoff("complete", DEFAULT_ATTEMPTS, || {
            let (record, reported) = (&record, &reported);
            async move { self.resolve_completion(job, record, reported).await }
        })
        .await?;

        match outcome {
            CompletionOutcome::Reported => {
                tracing::info!(
                    "Build {} finished with {} on {}",
                    job.id,
                    status,
                    job.assigned_agent.as_deref().unwrap_or("unknown agent")
                );
            }
            CompletionOutcome::Stale => {
                tracing::warn!(
                    "Discarding {} report for build {}: claim {} no longer owns it",
                    status,
                    job.id,
                    job.claim_id.as_deref().unwrap_or("-")
                );
            }
        }
        Ok(outcome)
    }

    async fn resolve_completion(
        &self,
        job: &BuildJob,
        record: &TerminalRecord,
        reported: &AtomicBool,
    ) -> Result<CompletionOutcome> {
        self.processing.lock(&job.id).await?;
        let result = self.resolve_completion_locked(job, record, reported).await;
        self.release(&job.id).await;
        result
    }

    async fn resolve_completion_locked(
        &self,
        job: &BuildJob,
        record: &TerminalRecord,
        reported: &AtomicBool,
    ) -> Result<CompletionOutcome> {
        match self.processing.get(&job.id).await? {
            Some(current) if current.claim_id == job.claim_id => {
                // Hand off first: until the report lands the entry must stay
                // visible to the monitor.
                self.report_once(record, reported).await?;
                let removed = self
                    .processing
                    .compare_and_set(&job.id, Some(&current), None)
                    .await?;
                if !removed {
                    tracing::warn!(
                        "In-flight entry for build {} changed under its lock after reporting",
                        job.id
                    );
                }
                Ok(CompletionOutcome::Reported)
            }
            // An earlier attempt already handed the record off.
            _ if reported.load(Ordering::SeqCst) => Ok(CompletionOutcome::Reported),
            Some(_) => Ok(CompletionOutcome::Stale),
            None => self.complete_requeued(job, record, reported).await,
        }
    }

    /// The monitor requeued the job and nobody has claimed it again yet.
    async fn complete_requeued(
        &self,
        job: &BuildJob,
        record: &TerminalRecord,
        reported: &AtomicBool,
    ) -> Result<CompletionOutcome> {
        let queued = self
            .queue
            .get_all()
            .await?
            .into_iter()
            .find(|queued| queued.id == job.id);
        let Some(queued) = queued else {
            return Ok(CompletionOutcome::Stale);
        };
        if !self.queue.remove_by_id(&job.id.0).await? {
            return Ok(CompletionOutcome::Stale);
        }

        tracing::info!(
            "Late completion for build {} wins over its pending requeue",
            job.id
        );
        if let Err(e) = self.report_once(record, reported).await {
            tracing::warn!("Returning build {} to the queue after a failed report", job.id);
            retry_with_backoff("restore requeued build", DEFAULT_ATTEMPTS, || {
                let queued = &queued;
                async move { self.queue.add(queued).await }
            })
            .await?;
            return Err(e);
        }
        Ok(CompletionOutcome::Reported)
    }

    async fn report_once(&self, record: &TerminalRecord, reported: &AtomicBool) -> Result<()> {
        if reported.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.report(record).await?;
        reported.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Hands a terminal record to the persistence collaborator, retrying
    /// with backoff.
    pub async fn report(&self, record: &TerminalRecord) -> Result<()> {
        retry_collaborator("report result", DEFAULT_ATTEMPTS, || {
            let reporter = self.reporter.clone();
            async move { reporter.report(record).await }
        })
        .await
        .map_err(|e| {
            tracing::error!("Failed to report result for build {}: {:#}", record.job_id, e);
            CoordinatorError::ReportFailed {
                job_id: record.job_id.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Releases a key lock. A lost lock is logged, never fatal: the
    /// compare-and-set already guarded the write.
    pub(crate) async fn release(&self, id: &BuildJobId) {
        if let Err(e) = self.processing.unlock(id).await {
            tracing::warn!("Failed to release lock on build {}: {}", id, e);
        }
    }

    async fn find_claim(&self, claim_id: &str) -> Result<Option<BuildJob>> {
        Ok(self
            .processing
            .values()
            .await?
            .into_iter()
            .find(|job| job.claim_id.as_deref() == Some(claim_id)))
    }

    // --- Read side ---

    pub async fn queue_depth(&self) -> Result<usize> {
        self.queue.size().await
    }

    /// Live concurrency level of the fleet.
    pub async fn in_flight_count(&self) -> Result<usize> {
        self.processing.size().await
    }

    pub async fn queued_jobs(&self) -> Result<Vec<BuildJob>> {
        self.queue.get_all().await
    }

    pub async fn running_jobs(&self) -> Result<Vec<BuildJob>> {
        let mut jobs = self.processing.values().await?;
        jobs.sort_by_key(|job| job.started_at);
        Ok(jobs)
    }
}
