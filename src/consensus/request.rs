//! Consensus requests, their lifecycle states and results.

use crate::consensus::voting::{AgentRoster, Tally, Vote, VoteType};
use crate::core::types::duration_secs;
use crate::core::{now, Error, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Defaults applied to new consensus requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Fraction of required voters that must vote
    pub quorum_percentage: f64,
    /// Approving share of the cast weight needed to approve
    pub approval_threshold: f64,
    /// Whether veto agents can block a request
    pub veto_enabled: bool,
    /// Time a request stays open
    #[serde(rename = "timeout_seconds", with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_percentage: 0.5,
            approval_threshold: 0.6,
            veto_enabled: true,
            timeout: Duration::from_secs(300),
        }
    }
}

impl ConsensusConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        check_fraction("quorum_percentage", self.quorum_percentage)?;
        check_fraction("approval_threshold", self.approval_threshold)?;
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout must be positive".to_string()));
        }
        Ok(())
    }
}

fn check_fraction(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "{field} must be in (0, 1], got {value}"
        )))
    }
}

/// Lifecycle state of a consensus request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusState {
    /// Created, no votes yet
    Pending,
    /// At least one vote received
    Collecting,
    Approved,
    Rejected,
    Vetoed,
    Expired,
    Cancelled,
}

impl ConsensusState {
    /// Whether the request is finalized.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConsensusState::Pending | ConsensusState::Collecting)
    }
}

impl std::fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsensusState::Pending => "pending",
            ConsensusState::Collecting => "collecting",
            ConsensusState::Approved => "approved",
            ConsensusState::Rejected => "rejected",
            ConsensusState::Vetoed => "vetoed",
            ConsensusState::Expired => "expired",
            ConsensusState::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// What a requester asks the agents to decide.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusSpec {
    pub trace_id: Option<String>,
    /// Kind of decision, e.g. "remediation"
    pub request_type: String,
    pub title: String,
    pub description: String,
    pub requested_by: Option<String>,
    pub incident_id: Option<String>,
    pub proposal_id: Option<String>,
    /// Subject of the decision
    pub payload: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,

    /// Agents that must vote
    pub required_voters: BTreeSet<String>,
    /// Agents that may vote
    pub optional_voters: BTreeSet<String>,
    pub quorum_percentage: f64,
    pub approval_threshold: f64,
    pub veto_enabled: bool,
    /// Agents whose veto finalizes the request
    pub veto_agents: BTreeSet<String>,
    #[serde(rename = "timeout_seconds", with = "duration_secs")]
    pub timeout: Duration,
}

impl ConsensusSpec {
    /// Create a spec with the default thresholds.
    pub fn new<I, S>(title: &str, required_voters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(title, required_voters, &ConsensusConfig::default())
    }

    /// Create a spec with thresholds taken from `config`.
    pub fn with_config<I, S>(title: &str, required_voters: I, config: &ConsensusConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trace_id: None,
            request_type: "decision".to_string(),
            title: title.to_string(),
            description: String::new(),
            requested_by: None,
            incident_id: None,
            proposal_id: None,
            payload: HashMap::new(),
            metadata: HashMap::new(),
            required_voters: required_voters.into_iter().map(Into::into).collect(),
            optional_voters: BTreeSet::new(),
            quorum_percentage: config.quorum_percentage,
            approval_threshold: config.approval_threshold,
            veto_enabled: config.veto_enabled,
            veto_agents: BTreeSet::new(),
            timeout: config.timeout,
        }
    }

    /// Create a spec whose voter sets come from `roster`.
    pub fn from_roster(title: &str, roster: &AgentRoster, config: &ConsensusConfig) -> Self {
        let mut spec = Self::with_config(title, roster.required_voters(), config);
        spec.optional_voters = roster.optional_voters();
        spec.veto_agents = roster.veto_agents();
        spec
    }

    pub fn with_optional_voters<I, S>(mut self, voters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_voters = voters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_veto_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.veto_agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_quorum(mut self, quorum_percentage: f64) -> Self {
        self.quorum_percentage = quorum_percentage;
        self
    }

    pub fn with_threshold(mut self, approval_threshold: f64) -> Self {
        self.approval_threshold = approval_threshold;
        self
    }

    pub fn with_veto_enabled(mut self, enabled: bool) -> Self {
        self.veto_enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_request_type(mut self, request_type: &str) -> Self {
        self.request_type = request_type.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_trace_id(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }

    pub fn requested_by(mut self, agent_id: &str) -> Self {
        self.requested_by = Some(agent_id.to_string());
        self
    }

    pub fn with_incident(mut self, incident_id: &str) -> Self {
        self.incident_id = Some(incident_id.to_string());
        self
    }

    pub fn with_proposal(mut self, proposal_id: &str) -> Self {
        self.proposal_id = Some(proposal_id.to_string());
        self
    }

    pub fn with_payload(mut self, key: &str, value: serde_json::Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Check the voting rules.
    pub fn validate(&self) -> Result<()> {
        if self.required_voters.is_empty() {
            return Err(Error::InvalidConfig(
                "required_voters must not be empty".to_string(),
            ));
        }
        check_fraction("quorum_percentage", self.quorum_percentage)?;
        check_fraction("approval_threshold", self.approval_threshold)?;
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Whether `agent_id` may vote on this request.
    pub fn is_eligible(&self, agent_id: &str) -> bool {
        self.required_voters.contains(agent_id)
            || self.optional_voters.contains(agent_id)
            || self.veto_agents.contains(agent_id)
    }

    /// Whether a veto from `agent_id` finalizes the request.
    pub fn can_veto(&self, agent_id: &str) -> bool {
        self.veto_enabled && self.veto_agents.contains(agent_id)
    }
}

/// A decision being voted on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusRequest {
    /// Request ID
    pub id: String,
    #[serde(flatten)]
    pub spec: ConsensusSpec,
    pub created_at: Timestamp,
    /// `created_at + timeout`
    pub expires_at: Timestamp,
    pub state: ConsensusState,
}

impl ConsensusRequest {
    /// Create a pending request. The spec is not validated here.
    pub fn new(spec: ConsensusSpec) -> Self {
        let created_at = now();
        let expires_at = chrono::Duration::from_std(spec.timeout)
            .ok()
            .and_then(|timeout| created_at.checked_add_signed(timeout))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            created_at,
            expires_at,
            state: ConsensusState::Pending,
        }
    }
}

/// Snapshot of a request's tally.
///
/// Frozen once the request reaches a terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub consensus_id: String,
    pub state: ConsensusState,
    pub total_votes: usize,
    pub approve_votes: usize,
    pub reject_votes: usize,
    pub abstain_votes: usize,
    pub veto_votes: usize,
    pub participation: f64,
    /// Approving share of the cast weight, in [0, 1]
    pub weighted_approval: f64,
    pub quorum_met: bool,
    pub threshold_met: bool,
    /// What finalized the request, e.g. "veto:qa-agent"
    pub deciding_factor: Option<String>,
    /// Conditions attached to approving votes
    pub conditions: Vec<serde_json::Value>,
    pub votes: Vec<Vote>,
    pub decided_at: Option<Timestamp>,
}

impl ConsensusResult {
    /// Build a snapshot from a tally.
    pub fn from_tally(request: &ConsensusRequest, votes: &[Vote], tally: &Tally) -> Self {
        let conditions = votes
            .iter()
            .filter(|v| v.vote_type == VoteType::Approve)
            .filter_map(|v| v.conditions.clone())
            .collect();

        Self {
            consensus_id: request.id.clone(),
            state: request.state,
            total_votes: tally.total_votes,
            approve_votes: tally.approve_votes,
            reject_votes: tally.reject_votes,
            abstain_votes: tally.abstain_votes,
            veto_votes: tally.veto_votes,
            participation: tally.participation,
            weighted_approval: tally.weighted_approval,
            quorum_met: tally.quorum_met,
            threshold_met: tally.threshold_met,
            deciding_factor: None,
            conditions,
            votes: votes.to_vec(),
            decided_at: None,
        }
    }

    /// Whether the request was approved.
    pub fn is_approved(&self) -> bool {
        self.state == ConsensusState::Approved
    }
}
