use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoordinatorError, Result};

/// Globally unique build identifier. Never reused.
///
/// Serialized as a bare string so it doubles as the queue item key (`id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BuildJobId(pub String);

impl BuildJobId {
    /// Generates a new random UUID v4-based id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BuildJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BuildJobId {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Which repository of an exercise the build is for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildPlanType {
    Template,
    Solution,
    Student,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queued,
    Running,
    Successful,
    Failed,
    Error,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "QUEUED",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Successful => "SUCCESSFUL",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Error => "ERROR",
            BuildStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal statuses are immutable once set.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Queued | BuildStatus::Running)
    }

    /// `QUEUED -> RUNNING -> terminal`, plus the `RUNNING -> QUEUED` requeue.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        match (self, next) {
            (BuildStatus::Queued, BuildStatus::Running) => true,
            (BuildStatus::Running, BuildStatus::Queued) => true,
            (BuildStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn ensure_transition(&self, next: BuildStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer submits. Everything else about the job is assigned here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildJobDescriptor {
    pub participation_id: u64,
    pub exercise_id: u64,
    pub plan_type: BuildPlanType,
}

/// The unit of dispatchable work, as stored in the queue and the in-flight map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildJob {
    pub id: BuildJobId,
    pub participation_id: u64,
    pub exercise_id: u64,
    pub plan_type: BuildPlanType,
    pub status: BuildStatus,
    /// Agent holding the job while `RUNNING`.
    pub assigned_agent: Option<String>,
    /// Fresh for every claim; distinguishes a re-claimed job from the
    /// attempt that was requeued away from a dead agent.
    pub claim_id: Option<String>,
    /// Timestamps in milliseconds since the Unix epoch.
    pub enqueued_at: u64,
    pub started_at: Option<u64>,
    pub updated_at: u64,
    pub requeue_count: u32,
    /// Bumped on every refresh and requeue.
    pub version: u64,
}

impl BuildJob {
    pub fn queued(descriptor: &BuildJobDescriptor, now: u64) -> Self {
        Self {
            id: BuildJobId::new(),
            participation_id: descriptor.participation_id,
            exercise_id: descriptor.exercise_id,
            plan_type: descriptor.plan_type,
            status: BuildStatus::Queued,
            assigned_agent: None,
            claim_id: None,
            enqueued_at: now,
            started_at: None,
            updated_at: now,
            requeue_count: 0,
            version: 0,
        }
    }

    /// Time since the entry was last written.
    pub fn stale_for(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.updated_at))
    }

    pub fn is_stale(&self, now: u64, claim_timeout: Duration) -> bool {
        self.stale_for(now) > claim_timeout
    }

    /// Lease renewal by the owning agent.
    pub fn refreshed(&self, now: u64) -> Self {
        Self {
            updated_at: now.max(self.updated_at),
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// The `RUNNING -> QUEUED` recovery transition.
    pub fn requeued(&self, now: u64) -> Result<Self> {
        self.status.ensure_transition(BuildStatus::Queued)?;
        Ok(Self {
            status: BuildStatus::Queued,
            assigned_agent: None,
            claim_id: None,
            started_at: None,
            updated_at: now,
            requeue_count: self.requeue_count + 1,
            version: self.version + 1,
            ..self.clone()
        })
    }
}

/// Fields written onto a job as it moves from the queue into the in-flight map.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimPatch {
    pub status: BuildStatus,
    pub assigned_agent: String,
    pub claim_id: String,
    pub started_at: u64,
    pub updated_at: u64,
}

impl ClaimPatch {
    pub fn new(agent: &str, now: u64) -> Self {
        Self {
            status: BuildStatus::Running,
            assigned_agent: agent.to_string(),
            claim_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
        }
    }
}

/// Why a job ended, so operators can tell infrastructure trouble from a
/// failing build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalCause {
    /// The owning agent reported the status.
    Reported,
    /// Forced to `ERROR` after exhausting its requeue attempts.
    PoisonJob,
}

/// What the persistence collaborator receives once a job is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalRecord {
    pub job_id: BuildJobId,
    pub participation_id: u64,
    pub exercise_id: u64,
    pub plan_type: BuildPlanType,
    pub status: BuildStatus,
    pub cause: TerminalCause,
    pub agent: Option<String>,
    pub enqueued_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: u64,
    pub requeue_count: u32,
    /// Claim the record was produced under. Together with `job_id` it
    /// identifies a record uniquely, so persistence can drop duplicates.
    #[serde(default)]
    pub claim_id: Option<String>,
}

impl TerminalRecord {
    pub fn from_job(job: &BuildJob, status: BuildStatus, cause: TerminalCause, now: u64) -> Self {
        Self {
            job_id: job.id.clone(),
            participation_id: job.participation_id,
            exercise_id: job.exercise_id,
            plan_type: job.plan_type,
            status,
            cause,
            agent: job.assigned_agent.clone(),
            enqueued_at: job.enqueued_at,
            started_at: job.started_at,
            completed_at: now,
            requeue_count: job.requeue_count,
            claim_id: job.claim_id.clone(),
        }
    }
}

/// How a completion report was resolved against the in-flight map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The terminal record was handed to the result reporter.
    Reported,
    /// Another attempt owns the job now; this report was discarded.
    Stale,
}
