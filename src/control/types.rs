use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic every agent subscribes to at startup.
pub const AGENT_CONTROL_TOPIC: &str = "build-agent-control";

/// Fleet-wide control signal. Fire-and-forget: never acknowledged or retried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "agent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Ungraceful self-termination of the named agent.
    KillAgent(String),
    /// Every agent stops claiming and exits once its running builds report.
    ShutdownAllAgents,
    /// The named agent stops claiming new builds.
    PauseAgent(String),
    ResumeAgent(String),
}

impl ControlMessage {
    /// True if `agent` must act on this message.
    pub fn targets(&self, agent: &str) -> bool {
        match self {
            ControlMessage::KillAgent(name)
            | ControlMessage::PauseAgent(name)
            | ControlMessage::ResumeAgent(name) => name == agent,
            ControlMessage::ShutdownAllAgents => true,
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::KillAgent(name) => write!(f, "kill {}", name),
            ControlMessage::ShutdownAllAgents => f.write_str("shutdown all"),
            ControlMessage::PauseAgent(name) => write!(f, "pause {}", name),
            ControlMessage::ResumeAgent(name) => write!(f, "resume {}", name),
        }
    }
}
