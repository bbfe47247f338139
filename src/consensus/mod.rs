//! Consensus Module
//!
//! Multi-agent decision making for risky or collective actions:
//! - Weighted voting with quorum and approval threshold
//! - Veto agents that can block a decision outright
//! - Request lifecycle with timeout and cancellation
//!
//! This is a single coordinator tallying votes from known agents, not a
//! replicated-log protocol.

pub mod coordinator;
pub mod request;
pub mod voting;

pub use coordinator::{ConsensusCoordinator, ConsensusStatistics};
pub use request::{
    ConsensusConfig, ConsensusRequest, ConsensusResult, ConsensusSpec, ConsensusState,
};
pub use voting::{tally, AgentRoster, AgentWeight, Tally, Vote, VoteType};
