//! Hand-off of terminal build records to persistence.
//!
//! This core keeps no terminal records itself. `ResultQueueReporter` pushes
//! them onto a shared queue that the persistence side drains.

use async_trait::async_trait;

use super::types::TerminalRecord;
use crate::storage::{DataProvider, DistributedQueue};

pub const BUILD_RESULT_QUEUE: &str = "build-result-queue";

#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report(&self, record: &TerminalRecord) -> anyhow::Result<()>;
}

pub struct ResultQueueReporter {
    queue: DistributedQueue<TerminalRecord>,
}

impl ResultQueueReporter {
    pub fn new(provider: &DataProvider) -> Self {
        Self {
            queue: provider.get_queue(BUILD_RESULT_QUEUE),
        }
    }

    pub fn queue(&self) -> &DistributedQueue<TerminalRecord> {
        &self.queue
    }
}

#[async_trait]
impl ResultReporter for ResultQueueReporter {
    /// Retries of the same record (same job and claim) are queued once.
    async fn report(&self, record: &TerminalRecord) -> anyhow::Result<()> {
        let op_id = format!(
            "result-{}-{}",
            record.job_id,
            record.claim_id.as_deref().unwrap_or("-")
        );
        self.queue.add_once(record, &op_id).await?;
        tracing::debug!(
            "Queued result {} for build {}",
            record.status,
            record.job_id
        );
        Ok(())
    }
}
