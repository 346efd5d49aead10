//! Build-Job Lifecycle Module
//!
//! Everything that moves a build job through `QUEUED -> RUNNING -> terminal`.
//!
//! ## Components
//! - **`tracker`**: the state machine (enqueue, claim, refresh, complete).
//! - **`monitor`**: requeues orphaned jobs and terminates poison jobs.
//! - **`agent`**: the worker pool a build agent process runs.
//! - **`executor`**: seam to whatever actually performs the build.
//! - **`results`**: hand-off of terminal records to persistence.

pub mod agent;
pub mod executor;
pub mod monitor;
pub mod results;
pub mod tracker;
pub mod types;

pub use agent::{AgentHandle, BuildAgent};
pub use executor::{BuildExecutor, FnBuildExecutor, SimulatedBuildExecutor};
pub use monitor::{RequeueMonitor, ScanReport};
pub use results::{ResultQueueReporter, ResultReporter};
pub use tracker::BuildJobTracker;
pub use types::*;
