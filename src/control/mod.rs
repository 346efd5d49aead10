//! Agent control path: kill, fleet shutdown, pause and resume, all carried
//! as fire-and-forget messages on one shared topic.

pub mod controller;
pub mod types;

pub use controller::ChaosController;
pub use types::{AGENT_CONTROL_TOPIC, ControlMessage};

#[cfg(test)]
mod tests;
