//! Agent liveness & chaos controller.
//!
//! Publishes control messages on the agent control topic. This side performs
//! no authorization and never touches the in-flight map: a killed agent's
//! builds are recovered only by the requeue monitor.

use rand::seq::SliceRandom;
use std::collections::BTreeSet;

use super::types::{AGENT_CONTROL_TOPIC, ControlMessage};
use crate::builds::tracker::PROCESSING_JOBS;
use crate::builds::types::{BuildJob, BuildJobId};
use crate::config::validate_agent_name;
use crate::error::Result;
use crate::storage::{DataProvider, DistributedMap, DistributedTopic};

pub struct ChaosController {
    topic: DistributedTopic<ControlMessage>,
    processing: DistributedMap<BuildJobId, BuildJob>,
}

impl ChaosController {
    pub fn new(provider: &DataProvider) -> Self {
        Self {
            topic: provider.get_topic(AGENT_CONTROL_TOPIC),
            processing: provider.get_map(PROCESSING_JOBS),
        }
    }

    /// Tells the named agent to terminate immediately, without draining.
    pub async fn trigger_kill_agent(&self, agent: &str) -> Result<()> {
        validate_agent_name(agent)?;
        tracing::warn!("Publishing kill signal for agent {}", agent);
        self.publish(ControlMessage::KillAgent(agent.to_string())).await
    }

    /// Graceful fleet-wide drain. Separate from the kill path.
    pub async fn shutdown_all_agents(&self) -> Result<()> {
        tracing::info!("Publishing shutdown to all agents");
        self.publish(ControlMessage::ShutdownAllAgents).await
    }

    pub async fn pause_agent(&self, agent: &str) -> Result<()> {
        validate_agent_name(agent)?;
        self.publish(ControlMessage::PauseAgent(agent.to_string())).await
    }

    pub async fn resume_agent(&self, agent: &str) -> Result<()> {
        validate_agent_name(agent)?;
        self.publish(ControlMessage::ResumeAgent(agent.to_string())).await
    }

    /// Agents currently holding at least one running build, by name.
    ///
    /// Read from the in-flight map; there is no separate agent registry.
    pub async fn busy_agents(&self) -> Result<Vec<String>> {
        let agents: BTreeSet<String> = self
            .processing
            .values()
            .await?
            .into_iter()
            .filter_map(|job| job.assigned_agent)
            .collect();
        Ok(agents.into_iter().collect())
    }

    /// Kills one randomly chosen busy agent. Returns its name, or `None` if
    /// no agent holds a running build.
    pub async fn kill_random_agent(&self) -> Result<Option<String>> {
        let agents = self.busy_agents().await?;
        let Some(victim) = agents.choose(&mut rand::thread_rng()).cloned() else {
            tracing::info!("Chaos: no busy agent to kill");
            return Ok(None);
        };

        tracing::warn!("Chaos: picked {} out of {} busy agents", victim, agents.len());
        self.trigger_kill_agent(&victim).await?;
        Ok(Some(victim))
    }

    async fn publish(&self, message: ControlMessage) -> Result<()> {
        self.topic.publish(&message).await?;
        tracing::debug!("Published control message: {}", message);
        Ok(())
    }
}
