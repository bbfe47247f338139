//! # Aegis - Resilience & Consensus Core
//!
//! Fault-tolerance primitives and multi-agent decision making:
//! - **Resilience**: circuit breakers, retry with backoff, token-bucket
//!   backpressure and sliding-window rate limiting
//! - **Consensus**: weighted voting with quorum, threshold and veto
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aegis::consensus::{ConsensusCoordinator, Vote, VoteType};
//! use aegis::resilience::{CircuitBreakerRegistry, RetryExecutor};
//! use aegis::Error;
//!
//! #[tokio::main]
//! async fn main() -> aegis::Result<()> {
//!     // Protect an outbound call
//!     let breakers = CircuitBreakerRegistry::default();
//!     let retry = RetryExecutor::default();
//!     let body = retry
//!         .run(|| {
//!             breakers.execute("billing-api", || async {
//!                 Ok::<_, Error>("ok".to_string())
//!             })
//!         })
//!         .await?;
//!     println!("billing-api said {body}");
//!
//!     // Ask two agents to agree on a remediation
//!     let coordinator = ConsensusCoordinator::default();
//!     let spec = coordinator.spec("restart billing", ["qa", "ops"]);
//!     let request = coordinator.create_request(spec)?;
//!     coordinator.submit_vote(&request.id, Vote::new(&request.id, "qa", VoteType::Approve))?;
//!     let result = coordinator.result(&request.id)?;
//!     println!("decision: {}", result.state);
//!     Ok(())
//! }
//! ```

pub mod consensus;
pub mod core;
pub mod monitoring;
pub mod resilience;

pub use core::config::AegisConfig;
pub use core::error::{CircuitOpenError, Classify, Error, ErrorKind, Result, RetryExhaustedError};
