//! Agent registry and concurrency accounting.
//!
//! Invariant: `in_flight <= max_concurrency` for every agent at every
//! observed instant. Slots are acquired through `acquire_slot`, which
//! rejects rather than over-commits, and released on every terminal path.

use std::collections::{HashMap, HashSet};

use aspen_types::{AgentId, CapabilityId};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// One registered agent's routing facts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub capabilities: HashSet<CapabilityId>,
    pub max_concurrency: usize,
    /// Tasks currently owned by this agent
    pub in_flight: usize,
}

impl AgentRegistration {
    pub fn new(
        agent_id: AgentId,
        capabilities: impl IntoIterator<Item = CapabilityId>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            agent_id,
            capabilities: capabilities.into_iter().collect(),
            max_concurrency,
            in_flight: 0,
        }
    }

    pub fn covers(&self, capability: &CapabilityId) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn has_spare_slot(&self) -> bool {
        self.in_flight < self.max_concurrency
    }
}

/// Registry of agents keyed by id
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentRegistration>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: AgentRegistration) -> Result<(), SchedulerError> {
        if self.agents.contains_key(&registration.agent_id) {
            return Err(SchedulerError::DuplicateAgent(registration.agent_id));
        }
        self.agents
            .insert(registration.agent_id.clone(), registration);
        Ok(())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&AgentRegistration> {
        self.agents.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Whether any agent covers the capability, regardless of load
    pub fn any_covers(&self, capability: &CapabilityId) -> bool {
        self.agents
            .values()
            .any(|registration| registration.covers(capability))
    }

    /// Pick the least-loaded agent with a spare slot for the capability
    pub fn pick_agent(&self, capability: &CapabilityId) -> Option<AgentId> {
        self.agents
            .values()
            .filter(|registration| registration.covers(capability) && registration.has_spare_slot())
            .min_by_key(|registration| (registration.in_flight, registration.agent_id.0.clone()))
            .map(|registration| registration.agent_id.clone())
    }

    /// Claim one slot; rejects instead of exceeding the cap
    pub fn acquire_slot(&mut self, agent_id: &AgentId) -> Result<(), SchedulerError> {
        let registration = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.clone()))?;

        if registration.in_flight >= registration.max_concurrency {
            return Err(SchedulerError::ConcurrencyExceeded {
                agent_id: agent_id.clone(),
                max_concurrency: registration.max_concurrency,
            });
        }
        registration.in_flight += 1;
        Ok(())
    }

    /// Release one slot; saturates at zero
    pub fn release_slot(&mut self, agent_id: &AgentId) {
        if let Some(registration) = self.agents.get_mut(agent_id) {
            registration.in_flight = registration.in_flight.saturating_sub(1);
        }
    }
}
