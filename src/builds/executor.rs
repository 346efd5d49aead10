//! Build executor seam.
//!
//! The agent hands each claimed job to a `BuildExecutor` and reports
//! whatever terminal status it returns. An `Err` is reported as `ERROR`.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::types::{BuildJob, BuildStatus};

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(&self, job: &BuildJob) -> anyhow::Result<BuildStatus>;
}

/// Type alias for a thread-safe, asynchronous build function.
pub type BuildFn = Arc<
    dyn Fn(BuildJob) -> Pin<Box<dyn Future<Output = anyhow::Result<BuildStatus>> + Send>>
        + Send
        + Sync,
>;

/// Adapts a closure into a `BuildExecutor`.
pub struct FnBuildExecutor {
    build: BuildFn,
}

impl FnBuildExecutor {
    pub fn new<F, Fut>(build: F) -> Arc<Self>
    where
        F: Fn(BuildJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<BuildStatus>> + Send + 'static,
    {
        // Box::pin type-erases the concrete future so any async fn fits.
        let build: BuildFn = Arc::new(move |job: BuildJob| {
            Box::pin(build(job)) as Pin<Box<dyn Future<Output = anyhow::Result<BuildStatus>> + Send>>
        });
        Arc::new(Self { build })
    }
}

#[async_trait]
impl BuildExecutor for FnBuildExecutor {
    async fn execute(&self, job: &BuildJob) -> anyhow::Result<BuildStatus> {
        (self.build)(job.clone()).await
    }
}

/// Sleeps for a random duration and succeeds or fails at random.
/// Stands in for the real build pipeline when running the fleet locally.
pub struct SimulatedBuildExecutor {
    min_duration: Duration,
    max_duration: Duration,
    failure_rate: f64,
}

impl SimulatedBuildExecutor {
    pub fn new(min_duration: Duration, max_duration: Duration, failure_rate: f64) -> Self {
        Self {
            min_duration,
            max_duration: max_duration.max(min_duration),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl BuildExecutor for SimulatedBuildExecutor {
    async fn execute(&self, job: &BuildJob) -> anyhow::Result<BuildStatus> {
        let spread = self.max_duration - self.min_duration;
        let duration = self.min_duration + spread.mul_f64(rand::random::<f64>());
        tracing::debug!("Simulating build {} for {:?}", job.id, duration);
        tokio::time::sleep(duration).await;

        if rand::random::<f64>() < self.failure_rate {
            Ok(BuildStatus::Failed)
        } else {
            Ok(BuildStatus::Successful)
        }
    }
}
