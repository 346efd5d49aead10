//! Operator API Protocol
//!
//! Endpoints and DTOs for producers and operators: enqueueing builds, fleet
//! read-outs and the agent control surface.

use serde::{Deserialize, Serialize};

use crate::builds::types::{BuildJob, BuildJobId};

// --- API Endpoints ---

pub const ENDPOINT_BUILDS: &str = "/builds";
pub const ENDPOINT_BUILDS_QUEUED: &str = "/builds/queued";
pub const ENDPOINT_BUILDS_RUNNING: &str = "/builds/running";
pub const ENDPOINT_STATS: &str = "/stats";
pub const ENDPOINT_AGENT_KILL: &str = "/agents/:name/kill";
pub const ENDPOINT_AGENT_PAUSE: &str = "/agents/:name/pause";
pub const ENDPOINT_AGENT_RESUME: &str = "/agents/:name/resume";
pub const ENDPOINT_AGENTS_SHUTDOWN: &str = "/agents/shutdown";
pub const ENDPOINT_AGENTS_KILL_RANDOM: &str = "/agents/kill-random";

// --- Responses ---

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub accepted: bool,
    pub job_id: Option<BuildJobId>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobsResponse {
    pub jobs: Vec<BuildJob>,
}

/// Queue depth and in-flight count for dashboards.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub busy_agents: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    /// The agent the message was addressed to, if any.
    pub agent: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
