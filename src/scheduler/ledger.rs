//! In-memory record of agents and their resource inventories.
//!
//! The ledger is the only cross-agent shared mutable state; reserve/release
//! are plain arithmetic done under the ledger lock. It also tracks agent
//! heartbeats and the per-agent queues of pending workers waiting to be
//! picked up on the agent's next poll (the coordinator cannot push work to
//! agents).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::resources::Resources;

/// A worker the scheduler decided to start on an agent, waiting for the
/// agent's next get_next_jobs poll.
#[derive(Debug, Clone)]
pub struct PendingWorker {
    pub job_id: String,
    /// Set iff the job is a grid job.
    pub grid_worker_id: Option<String>,
}

#[derive(Debug)]
pub struct AgentEntry {
    pub agent_id: String,
    pub total_resources: Resources,
    pub available_resources: Resources,
    /// Job-specific agents only ever serve this job.
    pub job_affinity: Option<String>,
    pub last_heartbeat: Instant,
    pending: Vec<PendingWorker>,
}

impl AgentEntry {
    /// True iff this agent is allowed to run the given job at all.
    pub fn serves_job(&self, job_id: &str) -> bool {
        match &self.job_affinity {
            Some(affinity) => affinity == job_id,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub total_resources: Resources,
    pub available_resources: Resources,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    /// Same totals as before; nothing changed.
    Idempotent,
    /// Different totals: the agent restarted, its in-flight work is assumed
    /// lost. The caller must fail that work and the availability has been
    /// reset to the new totals.
    Restarted,
}

#[derive(Debug)]
pub struct ResourceLedger {
    agents: HashMap<String, AgentEntry>,
    agent_timeout: Duration,
}

impl ResourceLedger {
    pub fn new(agent_timeout: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            agent_timeout,
        }
    }

    pub fn register(
        &mut self,
        agent_id: &str,
        totals: Resources,
        job_affinity: Option<String>,
    ) -> RegisterOutcome {
        if let Some(existing) = self.agents.get_mut(agent_id) {
            existing.last_heartbeat = Instant::now();
            if existing.total_resources == totals {
                return RegisterOutcome::Idempotent;
            }
            tracing::warn!(
                agent_id,
                "Agent re-registered with different resources; treating as a restart"
            );
            existing.available_resources = totals.clone();
            existing.total_resources = totals;
            existing.job_affinity = job_affinity;
            existing.pending.clear();
            return RegisterOutcome::Restarted;
        }

        tracing::info!(agent_id, affinity = ?job_affinity, "Agent registered");
        self.agents.insert(
            agent_id.to_string(),
            AgentEntry {
                agent_id: agent_id.to_string(),
                available_resources: totals.clone(),
                total_resources: totals,
                job_affinity,
                last_heartbeat: Instant::now(),
                pending: Vec::new(),
            },
        );
        RegisterOutcome::New
    }

    /// Atomic: succeeds iff every requested component is available, and then
    /// subtracts.
    pub fn reserve(&mut self, agent_id: &str, requirement: &Resources) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };
        match agent.available_resources.subtract(requirement) {
            Some(remaining) => {
                agent.available_resources = remaining;
                true
            }
            None => false,
        }
    }

    /// Adds a reservation back. Availability never exceeds the agent's
    /// totals; going over indicates a double release and is clamped.
    pub fn release(&mut self, agent_id: &str, requirement: &Resources) {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            // The agent may have been declared lost in the meantime.
            tracing::debug!(agent_id, "Release for unknown agent ignored");
            return;
        };
        let mut restored = agent.available_resources.add(requirement);
        if !agent.total_resources.fits(&restored) {
            tracing::error!(
                agent_id,
                "Resource release would exceed the agent's totals; clamping"
            );
            restored = agent.total_resources.clone();
        }
        agent.available_resources = restored;
    }

    pub fn heartbeat(&mut self, agent_id: &str) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn add_pending_worker(&mut self, agent_id: &str, pending: PendingWorker) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.pending.push(pending);
        }
    }

    /// Takes the agent's pending workers so the same worker is never handed
    /// out twice.
    pub fn take_pending_workers(&mut self, agent_id: &str) -> Vec<PendingWorker> {
        match self.agents.get_mut(agent_id) {
            Some(agent) => std::mem::take(&mut agent.pending),
            None => Vec::new(),
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentEntry> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<AgentEntry> {
        self.agents.remove(agent_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentEntry> {
        self.agents.values()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<AgentSnapshot> = self
            .agents
            .values()
            .map(|a| AgentSnapshot {
                agent_id: a.agent_id.clone(),
                total_resources: a.total_resources.clone(),
                available_resources: a.available_resources.clone(),
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// True iff some agent serving this job could fit it when completely
    /// idle. When this is false (and agents exist), the job can never run.
    pub fn any_total_fits(&self, job_id: &str, requirement: &Resources) -> bool {
        self.agents
            .values()
            .any(|a| a.serves_job(job_id) && a.total_resources.fits(requirement))
    }

    /// Agents whose last heartbeat is older than the timeout.
    pub fn expired_agents(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| a.last_heartbeat.elapsed() > self.agent_timeout)
            .map(|a| a.agent_id.clone())
            .collect()
    }
}
