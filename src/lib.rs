//! CI Build Fleet Coordination Library
//!
//! Shared state and control plumbing for a fleet of build agents working off
//! one build-job queue. The binary (`main.rs`) wires these into the store
//! server, scheduler and agent processes.
//!
//! ## Architecture Modules
//! - **`storage`**: distributed queue, map and topic with change listeners,
//!   backed by an in-process store or a shared store server.
//! - **`builds`**: the build-job state machine, the orphan requeue monitor and
//!   the agent worker pool.
//! - **`control`**: kill, shutdown, pause and resume messages for agents.
//! - **`api`**: the operator HTTP surface.
//! - **`config`**, **`error`**, **`retry`**: shared settings, error taxonomy
//!   and backoff helpers.

pub mod api;
pub mod builds;
pub mod config;
pub mod control;
pub mod error;
pub mod retry;
pub mod storage;
