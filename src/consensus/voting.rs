//! Votes, agent weights and the weighted tally.
//!
//! Participation counts only required voters; approval is the approving share
//! of the weight cast for or against. Abstentions count toward participation
//! but never toward approval.

use crate::consensus::request::ConsensusRequest;
use crate::core::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Type of vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    /// Vote in favor
    Approve,
    /// Vote against
    Reject,
    /// No opinion
    Abstain,
    /// Blocking rejection, final when cast by an agent with veto power
    Veto,
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteType::Approve => write!(f, "approve"),
            VoteType::Reject => write!(f, "reject"),
            VoteType::Abstain => write!(f, "abstain"),
            VoteType::Veto => write!(f, "veto"),
        }
    }
}

/// A single vote from an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Vote ID
    pub id: String,
    /// Consensus request this vote belongs to
    pub consensus_id: String,
    /// Voting agent
    pub agent_id: String,
    /// Vote type
    pub vote_type: VoteType,
    /// Vote weight
    pub weight: f64,
    /// Vote timestamp
    pub timestamp: Timestamp,
    /// Optional explanation
    pub reasoning: Option<String>,
    /// References to supporting evidence
    pub evidence_refs: Vec<String>,
    /// Conditions attached to an approval
    pub conditions: Option<serde_json::Value>,
}

impl Vote {
    /// Create a new vote with weight 1.0.
    pub fn new(consensus_id: &str, agent_id: &str, vote_type: VoteType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            consensus_id: consensus_id.to_string(),
            agent_id: agent_id.to_string(),
            vote_type,
            weight: 1.0,
            timestamp: now(),
            reasoning: None,
            evidence_refs: Vec::new(),
            conditions: None,
        }
    }

    /// Set the weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Add reasoning.
    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = Some(reasoning.to_string());
        self
    }

    /// Attach an evidence reference.
    pub fn with_evidence(mut self, reference: &str) -> Self {
        self.evidence_refs.push(reference.to_string());
        self
    }

    /// Attach approval conditions.
    pub fn with_conditions(mut self, conditions: serde_json::Value) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

/// Voting profile of an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentWeight {
    /// Agent identifier
    pub agent_id: String,
    /// Voting weight
    pub weight: f64,
    /// Whether the agent can veto
    pub has_veto: bool,
    /// Whether the agent must vote
    pub required: bool,
    /// Areas where the agent has expertise
    pub expertise_areas: Vec<String>,
}

impl AgentWeight {
    /// Create a profile with weight 1.0, no veto, not required.
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            weight: 1.0,
            has_veto: false,
            required: false,
            expertise_areas: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_veto(mut self) -> Self {
        self.has_veto = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_expertise(mut self, areas: &[&str]) -> Self {
        self.expertise_areas = areas.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Known agents and their voting profiles.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentRoster {
    agents: HashMap<String, AgentWeight>,
}

impl AgentRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard five-agent setup.
    pub fn standard() -> Self {
        let mut roster = Self::new();
        roster.register(AgentWeight::new("super-agent").with_veto());
        roster.register(
            AgentWeight::new("qa-agent")
                .with_weight(1.5)
                .with_veto()
                .required()
                .with_expertise(&["security", "compliance", "testing"]),
        );
        roster.register(
            AgentWeight::new("problem-solver-agent")
                .required()
                .with_expertise(&["diagnosis", "solutions"]),
        );
        roster.register(
            AgentWeight::new("maintenance-agent").with_expertise(&["execution", "rollback"]),
        );
        roster.register(
            AgentWeight::new("learning-agent")
                .with_weight(0.5)
                .with_expertise(&["patterns", "history"]),
        );
        roster
    }

    /// Add or replace an agent.
    pub fn register(&mut self, agent: AgentWeight) {
        self.agents.insert(agent.agent_id.clone(), agent);
    }

    /// Remove an agent.
    pub fn unregister(&mut self, agent_id: &str) -> Option<AgentWeight> {
        self.agents.remove(agent_id)
    }

    /// Look up an agent.
    pub fn get(&self, agent_id: &str) -> Option<&AgentWeight> {
        self.agents.get(agent_id)
    }

    /// Agents that must vote.
    pub fn required_voters(&self) -> BTreeSet<String> {
        self.agents
            .values()
            .filter(|a| a.required)
            .map(|a| a.agent_id.clone())
            .collect()
    }

    /// Agents that may vote but are not required to.
    pub fn optional_voters(&self) -> BTreeSet<String> {
        self.agents
            .values()
            .filter(|a| !a.required)
            .map(|a| a.agent_id.clone())
            .collect()
    }

    /// Agents holding veto power.
    pub fn veto_agents(&self) -> BTreeSet<String> {
        self.agents
            .values()
            .filter(|a| a.has_veto)
            .map(|a| a.agent_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Outcome of counting the votes on a request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub total_votes: usize,
    pub approve_votes: usize,
    pub reject_votes: usize,
    pub abstain_votes: usize,
    pub veto_votes: usize,
    pub approve_weight: f64,
    pub reject_weight: f64,
    /// Share of required voters that voted
    pub participation: f64,
    /// Approving share of non-abstaining weight, 0 when nothing was cast
    pub weighted_approval: f64,
    pub quorum_met: bool,
    pub threshold_met: bool,
}

/// Count `votes` against the rules of `request`.
///
/// A veto without veto power counts as a rejection.
pub fn tally(request: &ConsensusRequest, votes: &[Vote]) -> Tally {
    let mut result = Tally {
        total_votes: votes.len(),
        ..Default::default()
    };

    let mut required_voted = 0usize;
    for vote in votes {
        if request.spec.required_voters.contains(&vote.agent_id) {
            required_voted += 1;
        }
        match vote.vote_type {
            VoteType::Approve => {
                result.approve_votes += 1;
                result.approve_weight += vote.weight;
            }
            VoteType::Reject => {
                result.reject_votes += 1;
                result.reject_weight += vote.weight;
            }
            VoteType::Abstain => result.abstain_votes += 1,
            VoteType::Veto => {
                result.veto_votes += 1;
                result.reject_weight += vote.weight;
            }
        }
    }

    let required = request.spec.required_voters.len();
    result.participation = if required == 0 {
        0.0
    } else {
        required_voted as f64 / required as f64
    };
    result.quorum_met = result.participation >= request.spec.quorum_percentage;

    let cast = result.approve_weight + result.reject_weight;
    result.weighted_approval = if cast > 0.0 {
        result.approve_weight / cast
    } else {
        0.0
    };
    result.threshold_met = result.weighted_approval >= request.spec.approval_threshold;

    result
}
