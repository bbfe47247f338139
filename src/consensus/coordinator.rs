//! Consensus coordinator.
//!
//! Collects weighted votes on a request and finalizes it when quorum and
//! threshold are decided, a veto agent blocks it, the timeout passes, or the
//! requester cancels. Each request is guarded by its own mutex; the request
//! map is only locked to find or insert entries.

use crate::consensus::request::{
    ConsensusConfig, ConsensusRequest, ConsensusResult, ConsensusSpec, ConsensusState,
};
use crate::consensus::voting::{tally, AgentRoster, Vote, VoteType};
use crate::core::{now, Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Capacity of the verdict channel.
const VERDICT_CHANNEL_CAPACITY: usize = 64;

/// Deadline used when a timeout does not fit the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Coordinator statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusStatistics {
    pub total_requests: usize,
    /// Requests still pending or collecting
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub vetoed: usize,
    pub expired: usize,
    pub cancelled: usize,
    /// Approved share of approved and rejected requests, as a percentage
    pub approval_rate: f64,
}

struct RequestEntry {
    request: ConsensusRequest,
    /// At most one vote per agent, in first-vote order
    votes: Vec<Vote>,
    /// Set once, when the request is finalized
    result: Option<ConsensusResult>,
    deadline: Instant,
    finalized_at: Option<Instant>,
    watcher: Option<AbortHandle>,
}

impl RequestEntry {
    fn snapshot(&self) -> ConsensusResult {
        ConsensusResult::from_tally(&self.request, &self.votes, &tally(&self.request, &self.votes))
    }

    /// Move to a terminal state and freeze the result.
    fn finalize(&mut self, state: ConsensusState, deciding_factor: String) -> ConsensusResult {
        self.request.state = state;
        let mut result = self.snapshot();
        result.deciding_factor = Some(deciding_factor);
        result.decided_at = Some(now());
        self.result = Some(result.clone());
        self.finalized_at = Some(Instant::now());
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }

        tracing::info!(
            consensus_id = %self.request.id,
            state = %state,
            weighted_approval = result.weighted_approval,
            participation = result.participation,
            "consensus finalized"
        );
        result
    }

    /// Expire the request if its deadline has passed.
    fn expire_if_due(&mut self) -> Option<ConsensusResult> {
        if self.request.state.is_terminal() || Instant::now() < self.deadline {
            return None;
        }
        Some(self.finalize(ConsensusState::Expired, "timeout".to_string()))
    }

    /// Apply the quorum and threshold rules.
    fn evaluate(&mut self) -> Option<ConsensusResult> {
        let counted = tally(&self.request, &self.votes);
        if !counted.quorum_met {
            return None;
        }
        let (state, relation) = if counted.threshold_met {
            (ConsensusState::Approved, "met")
        } else {
            (ConsensusState::Rejected, "below")
        };
        let factor = format!(
            "approval {:.1}% {} threshold {:.1}%",
            counted.weighted_approval * 100.0,
            relation,
            self.request.spec.approval_threshold * 100.0
        );
        Some(self.finalize(state, factor))
    }

    fn finalized_error(&self) -> Error {
        Error::ConsensusFinalized {
            consensus_id: self.request.id.clone(),
            state: self.request.state.to_string(),
        }
    }
}

type Entry = Arc<Mutex<RequestEntry>>;

struct Shared {
    config: ConsensusConfig,
    roster: AgentRoster,
    requests: RwLock<HashMap<String, Entry>>,
    verdicts: broadcast::Sender<ConsensusResult>,
}

impl Shared {
    fn publish(&self, result: &ConsensusResult) {
        // No subscribers is not an error
        let _ = self.verdicts.send(result.clone());
    }
}

/// Tallies weighted votes from multiple agents into verdicts.
///
/// Cloning is cheap; clones share the same requests.
#[derive(Clone)]
pub struct ConsensusCoordinator {
    shared: Arc<Shared>,
}

impl ConsensusCoordinator {
    /// Create a coordinator without a roster.
    pub fn new(config: ConsensusConfig) -> Result<Self> {
        Self::with_roster(config, AgentRoster::new())
    }

    /// Create a coordinator whose roster weights override submitted weights.
    pub fn with_roster(config: ConsensusConfig, roster: AgentRoster) -> Result<Self> {
        config.validate()?;
        let (verdicts, _) = broadcast::channel(VERDICT_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                roster,
                requests: RwLock::new(HashMap::new()),
                verdicts,
            }),
        })
    }

    /// Default thresholds for new requests.
    pub fn config(&self) -> &ConsensusConfig {
        &self.shared.config
    }

    pub fn roster(&self) -> &AgentRoster {
        &self.shared.roster
    }

    /// A spec using this coordinator's defaults.
    pub fn spec<I, S>(&self, title: &str, required_voters: I) -> ConsensusSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ConsensusSpec::with_config(title, required_voters, &self.shared.config)
    }

    /// A spec whose voters come from the roster.
    pub fn roster_spec(&self, title: &str) -> ConsensusSpec {
        ConsensusSpec::from_roster(title, &self.shared.roster, &self.shared.config)
    }

    /// Receive every finalized result.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusResult> {
        self.shared.verdicts.subscribe()
    }

    fn entry(&self, consensus_id: &str) -> Result<Entry> {
        self.shared
            .requests
            .read()
            .get(consensus_id)
            .cloned()
            .ok_or_else(|| Error::ConsensusNotFound(consensus_id.to_string()))
    }

    /// Open a new request.
    ///
    /// Inside a tokio runtime a watcher task expires the request at its
    /// deadline; expiry is also checked on every access.
    pub fn create_request(&self, spec: ConsensusSpec) -> Result<ConsensusRequest> {
        spec.validate()?;
        let started = Instant::now();
        let deadline = started
            .checked_add(spec.timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let request = ConsensusRequest::new(spec);
        let id = request.id.clone();

        let entry = Arc::new(Mutex::new(RequestEntry {
            request: request.clone(),
            votes: Vec::new(),
            result: None,
            deadline,
            finalized_at: None,
            watcher: None,
        }));
        self.shared
            .requests
            .write()
            .insert(id.clone(), Arc::clone(&entry));

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            let watched = Arc::clone(&entry);
            let task = runtime.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let expired = watched.lock().expire_if_due();
                if let Some(result) = expired {
                    shared.publish(&result);
                }
            });
            entry.lock().watcher = Some(task.abort_handle());
        }

        tracing::info!(
            consensus_id = %id,
            title = %request.spec.title,
            required = request.spec.required_voters.len(),
            timeout_secs = request.spec.timeout.as_secs_f64(),
            "consensus request created"
        );
        Ok(request)
    }

    /// Record a vote and re-tally.
    ///
    /// A second vote from the same agent replaces the first. Returns the
    /// snapshot after the vote, which is final if the vote decided the
    /// request.
    pub fn submit_vote(&self, consensus_id: &str, mut vote: Vote) -> Result<ConsensusResult> {
        if vote.consensus_id != consensus_id {
            return Err(Error::InvalidVote(format!(
                "vote for '{}' submitted to '{}'",
                vote.consensus_id, consensus_id
            )));
        }
        if !vote.weight.is_finite() || vote.weight < 0.0 {
            return Err(Error::InvalidVote(format!(
                "weight must be a non-negative number, got {}",
                vote.weight
            )));
        }

        let entry = self.entry(consensus_id)?;
        let (result, finalized) = {
            let mut entry = entry.lock();
            if entry.request.state.is_terminal() {
                return Err(entry.finalized_error());
            }
            if let Some(expired) = entry.expire_if_due() {
                let err = entry.finalized_error();
                drop(entry);
                self.shared.publish(&expired);
                return Err(err);
            }
            if !entry.request.spec.is_eligible(&vote.agent_id) {
                return Err(Error::VoterNotEligible {
                    consensus_id: consensus_id.to_string(),
                    agent_id: vote.agent_id,
                });
            }
            if let Some(agent) = self.shared.roster.get(&vote.agent_id) {
                vote.weight = agent.weight;
            }

            tracing::debug!(
                consensus_id,
                agent_id = %vote.agent_id,
                vote = %vote.vote_type,
                weight = vote.weight,
                "vote received"
            );

            let agent_id = vote.agent_id.clone();
            let vetoes = vote.vote_type == VoteType::Veto && entry.request.spec.can_veto(&agent_id);
            match entry.votes.iter().position(|v| v.agent_id == agent_id) {
                Some(i) => entry.votes[i] = vote,
                None => entry.votes.push(vote),
            }
            entry.request.state = ConsensusState::Collecting;

            let finalized = if vetoes {
                Some(entry.finalize(ConsensusState::Vetoed, format!("veto:{agent_id}")))
            } else {
                entry.evaluate()
            };
            match finalized {
                Some(result) => (result, true),
                None => (entry.snapshot(), false),
            }
        };

        if finalized {
            self.shared.publish(&result);
        }
        Ok(result)
    }

    /// Re-evaluate a request against its deadline and voting rules.
    pub fn tally(&self, consensus_id: &str) -> Result<ConsensusResult> {
        let entry = self.entry(consensus_id)?;
        let mut entry = entry.lock();
        if let Some(result) = &entry.result {
            return Ok(result.clone());
        }
        let finalized = match entry.expire_if_due() {
            Some(result) => Some(result),
            None if entry.request.state == ConsensusState::Collecting => entry.evaluate(),
            None => None,
        };
        drop(entry);

        match finalized {
            Some(result) => {
                self.shared.publish(&result);
                Ok(result)
            }
            None => self.result(consensus_id),
        }
    }

    /// Cancel a request that is still open.
    pub fn cancel(&self, consensus_id: &str) -> Result<ConsensusResult> {
        let entry = self.entry(consensus_id)?;
        let result = {
            let mut entry = entry.lock();
            if entry.request.state.is_terminal() {
                return Err(entry.finalized_error());
            }
            entry.finalize(ConsensusState::Cancelled, "cancelled".to_string())
        };
        self.shared.publish(&result);
        Ok(result)
    }

    /// The final result, or a snapshot while the request is open.
    pub fn result(&self, consensus_id: &str) -> Result<ConsensusResult> {
        let entry = self.entry(consensus_id)?;
        let mut entry = entry.lock();
        if let Some(result) = &entry.result {
            return Ok(result.clone());
        }
        match entry.expire_if_due() {
            Some(result) => {
                drop(entry);
                self.shared.publish(&result);
                Ok(result)
            }
            None => Ok(entry.snapshot()),
        }
    }

    /// The request as currently stored.
    pub fn request(&self, consensus_id: &str) -> Result<ConsensusRequest> {
        Ok(self.entry(consensus_id)?.lock().request.clone())
    }

    /// Votes recorded so far.
    pub fn votes(&self, consensus_id: &str) -> Result<Vec<Vote>> {
        Ok(self.entry(consensus_id)?.lock().votes.clone())
    }

    /// Requests that are not finalized yet, oldest first.
    pub fn pending_requests(&self) -> Vec<ConsensusRequest> {
        let mut pending: Vec<ConsensusRequest> = self
            .entries()
            .iter()
            .map(|entry| entry.lock().request.clone())
            .filter(|request| !request.state.is_terminal())
            .collect();
        pending.sort_by_key(|request| request.created_at);
        pending
    }

    /// Coordinator statistics.
    pub fn statistics(&self) -> ConsensusStatistics {
        let mut stats = ConsensusStatistics::default();
        for entry in self.entries() {
            stats.total_requests += 1;
            match entry.lock().request.state {
                ConsensusState::Pending | ConsensusState::Collecting => stats.pending += 1,
                ConsensusState::Approved => stats.approved += 1,
                ConsensusState::Rejected => stats.rejected += 1,
                ConsensusState::Vetoed => stats.vetoed += 1,
                ConsensusState::Expired => stats.expired += 1,
                ConsensusState::Cancelled => stats.cancelled += 1,
            }
        }
        let decided = stats.approved + stats.rejected;
        if decided > 0 {
            stats.approval_rate = stats.approved as f64 / decided as f64 * 100.0;
        }
        stats
    }

    /// Drop requests finalized at least `older_than` ago.
    ///
    /// Returns how many were removed. Open requests are never dropped.
    pub fn purge_finalized(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let mut requests = self.shared.requests.write();
        let before = requests.len();
        requests.retain(|_, entry| match entry.lock().finalized_at {
            Some(at) => now.saturating_duration_since(at) < older_than,
            None => true,
        });
        let removed = before - requests.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = requests.len(), "purged finalized requests");
        }
        removed
    }

    /// Number of requests tracked.
    pub fn len(&self) -> usize {
        self.shared.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.requests.read().is_empty()
    }

    fn entries(&self) -> Vec<Entry> {
        self.shared.requests.read().values().cloned().collect()
    }
}

impl Default for ConsensusCoordinator {
    fn default() -> Self {
        let (verdicts, _) = broadcast::channel(VERDICT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config: ConsensusConfig::default(),
                roster: AgentRoster::new(),
                requests: RwLock::new(HashMap::new()),
                verdicts,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::voting::AgentWeight;
    use futures::future::join_all;

    fn four_voters(coordinator: &ConsensusCoordinator) -> String {
        let spec = coordinator
            .spec("apply remediation", ["A", "B", "C", "D"])
            .with_veto_agents(["V"]);
        coordinator.create_request(spec).unwrap().id
    }

    fn vote(id: &str, agent: &str, vote_type: VoteType) -> Vote {
        Vote::new(id, agent, vote_type)
    }

    #[tokio::test]
    async fn test_two_approvals_reach_quorum_and_threshold() {
        let c = ConsensusCoordinator::default();
        let id = four_voters(&c);

        let first = c.submit_vote(&id, vote(&id, "A", VoteType::Approve)).unwrap();
        assert_eq!(first.state, ConsensusState::Collecting);
        assert!(!first.quorum_met);

        let result = c.submit_vote(&id, vote(&id, "B", VoteType::Approve)).unwrap();
        assert_eq!(result.state, ConsensusState::Approved);
        assert_eq!(result.participation, 0.5);
        assert_eq!(result.weighted_approval, 1.0);
        assert!(result.quorum_met && result.threshold_met);
        assert!(result.decided_at.is_some());
        assert_eq!(c.result(&id).unwrap().state, ConsensusState::Approved);
    }

    #[tokio::test]
    async fn test_reject_at_quorum() {
        let c = ConsensusCoordinator::default();
        let id = four_voters(&c);

        c.submit_vote(&id, vote(&id, "A", VoteType::Approve)).unwrap();
        let result = c.submit_vote(&id, vote(&id, "B", VoteType::Reject)).unwrap();
        assert_eq!(result.state, ConsensusState::Rejected);
        assert_eq!(result.weighted_approval, 0.5);
        assert!(!result.threshold_met);
    }

    #[tokio::test]
    async fn test_last_vote_wins_before_finalization() {
        let c = ConsensusCoordinator::default();
        let spec = c.spec("scale out", ["A", "B", "C"]).with_quorum(1.0);
        let id = c.create_request(spec).unwrap().id;

        c.submit_vote(&id, vote(&id, "A", VoteType::Reject)).unwrap();
        c.submit_vote(&id, vote(&id, "A", VoteType::Approve)).unwrap();

        let votes = c.votes(&id).unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].vote_type, VoteType::Approve);

        let snapshot = c.result(&id).unwrap();
        assert_eq!(snapshot.state, ConsensusState::Collecting);
        assert_eq!(snapshot.approve_votes, 1);
        assert_eq!(snapshot.reject_votes, 0);
    }

    #[tokio::test]
    async fn test_vote_after_finalization_is_rejected() {
        let c = ConsensusCoordinator::default();
        let id = four_voters(&c);
        c.submit_vote(&id, vote(&id, "A", VoteType::Approve)).unwrap();
        c.submit_vote(&id, vote(&id, "B", VoteType::Approve)).unwrap();

        let err = c
            .submit_vote(&id, vote(&id, "C", VoteType::Reject))
            .unwrap_err();
        assert!(matches!(err, Error::ConsensusFinalized { ref state, .. } if state == "approved"));
        assert_eq!(c.result(&id).unwrap().total_votes, 2);
    }

    #[tokio::test]
    async fn test_veto_finalizes_immediately() {
        let c = ConsensusCoordinator::default();
        let id = four_voters(&c);
        c.submit_vote(&id, vote(&id, "A", VoteType::Approve)).unwrap();

        let result = c.submit_vote(&id, vote(&id, "V", VoteType::Veto)).unwrap();
        assert_eq!(result.state, ConsensusState::Vetoed);
        assert_eq!(result.deciding_factor.as_deref(), Some("veto:V"));
        assert!(c.submit_vote(&id, vote(&id, "B", VoteType::Approve)).is_err());
    }

    #[tokio::test]
    async fn test_veto_disabled_counts_as_reject() {
        let c = ConsensusCoordinator::default();
        let spec = c
            .spec("purge cache", ["A", "B"])
            .with_veto_agents(["A"])
            .with_veto_enabled(false)
            .with_quorum(1.0);
        let id = c.create_request(spec).unwrap().id;

        c.submit_vote(&id, vote(&id, "A", VoteType::Veto)).unwrap();
        let result = c.submit_vote(&id, vote(&id, "B", VoteType::Approve)).unwrap();
        assert_eq!(result.state, ConsensusState::Rejected);
        assert_eq!(result.veto_votes, 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let c = ConsensusCoordinator::default();
        let id = four_voters(&c);
        c.submit_vote(&id, vote(&id, "A", VoteType::Approve)).unwrap();

        let result = c.cancel(&id).unwrap();
        assert_eq!(result.state, ConsensusState::Cancelled);
        assert!(matches!(c.cancel(&id), Err(Error::ConsensusFinalized { .. })));
        assert!(matches!(
            c.submit_vote(&id, vote(&id, "B", VoteType::Approve)),
            Err(Error::ConsensusFinalized { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_expires_request() {
        let c = ConsensusCoordinator::default();
        let mut verdicts = c.subscribe();
        let spec = c
            .spec("rotate keys", ["A", "B"])
            .with_quorum(1.0)
            .with_timeout(Duration::from_secs(30));
        let id = c.create_request(spec).unwrap().id;
        c.submit_vote(&id, vote(&id, "A", VoteType::Abstain)).unwrap();

        let verdict = verdicts.recv().await.unwrap();
        assert_eq!(verdict.consensus_id, id);
        assert_eq!(verdict.state, ConsensusState::Expired);
        assert_eq!(verdict.deciding_factor.as_deref(), Some("timeout"));
        assert_eq!(c.request(&id).unwrap().state, ConsensusState::Expired);
    }

    #[test]
    fn test_late_vote_expires_without_runtime() {
        let c = ConsensusCoordinator::default();
        let spec = c.spec("rotate keys", ["A"]).with_timeout(Duration::from_millis(1));
        let id = c.create_request(spec).unwrap().id;
        std::thread::sleep(Duration::from_millis(5));

        let err = c
            .submit_vote(&id, vote(&id, "A", VoteType::Approve))
            .unwrap_err();
        assert!(matches!(err, Error::ConsensusFinalized { ref state, .. } if state == "expired"));
        assert_eq!(c.statistics().expired, 1);
    }

    #[tokio::test]
    async fn test_subscribe_receives_verdicts() {
        let c = ConsensusCoordinator::default();
        let mut verdicts = c.subscribe();
        let id = four_voters(&c);
        c.submit_vote(&id, vote(&id, "V", VoteType::Veto)).unwrap();

        let verdict = verdicts.recv().await.unwrap();
        assert_eq!(verdict.state, ConsensusState::Vetoed);
    }

    #[tokio::test]
    async fn test_invalid_requests_and_votes() {
        let c = ConsensusCoordinator::default();
        let empty: [&str; 0] = [];
        assert!(matches!(
            c.create_request(c.spec("x", empty)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(c.create_request(c.spec("x", ["A"]).with_threshold(0.0)).is_err());

        let id = four_voters(&c);
        assert!(matches!(
            c.submit_vote(&id, vote(&id, "Z", VoteType::Approve)),
            Err(Error::VoterNotEligible { .. })
        ));
        assert!(matches!(
            c.submit_vote(&id, vote(&id, "A", VoteType::Approve).with_weight(-1.0)),
            Err(Error::InvalidVote(_))
        ));
        assert!(matches!(
            c.submit_vote(&id, vote("other", "A", VoteType::Approve)),
            Err(Error::InvalidVote(_))
        ));
        assert!(matches!(c.result("missing"), Err(Error::ConsensusNotFound(_))));
        assert_eq!(c.request(&id).unwrap().state, ConsensusState::Pending);
    }

    #[tokio::test]
    async fn test_roster_weight_overrides_vote_weight() {
        let mut roster = AgentRoster::new();
        roster.register(AgentWeight::new("A").with_weight(3.0).required());
        roster.register(AgentWeight::new("B").required());
        let c = ConsensusCoordinator::with_roster(ConsensusConfig::default(), roster).unwrap();

        let spec = c.roster_spec("failover").with_quorum(1.0).with_threshold(0.7);
        let id = c.create_request(spec).unwrap().id;
        c.submit_vote(&id, vote(&id, "A", VoteType::Approve).with_weight(0.1))
            .unwrap();
        let result = c.submit_vote(&id, vote(&id, "B", VoteType::Reject)).unwrap();

        assert_eq!(result.weighted_approval, 0.75);
        assert_eq!(result.state, ConsensusState::Approved);
        assert_eq!(c.votes(&id).unwrap()[0].weight, 3.0);
    }

    #[tokio::test]
    async fn test_standard_roster_flow() {
        let c = ConsensusCoordinator::with_roster(ConsensusConfig::default(), AgentRoster::standard())
            .unwrap();
        let id = c.create_request(c.roster_spec("restart payments")).unwrap().id;

        let conditions = serde_json::json!({"max_pods": 2});
        c.submit_vote(
            &id,
            vote(&id, "qa-agent", VoteType::Approve).with_conditions(conditions.clone()),
        )
        .unwrap();
        let result = c.result(&id).unwrap();
        assert_eq!(result.state, ConsensusState::Approved);
        assert_eq!(result.conditions, vec![conditions]);
    }

    #[tokio::test]
    async fn test_statistics_and_pending() {
        let c = ConsensusCoordinator::default();
        assert_eq!(c.statistics().approval_rate, 0.0);

        let approved = four_voters(&c);
        c.submit_vote(&approved, vote(&approved, "A", VoteType::Approve)).unwrap();
        c.submit_vote(&approved, vote(&approved, "B", VoteType::Approve)).unwrap();
        let cancelled = four_voters(&c);
        c.cancel(&cancelled).unwrap();
        let open = four_voters(&c);

        let stats = c.statistics();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.cancelled, 1);
        // Cancelled requests do not count against the rate
        assert_eq!(stats.approval_rate, 100.0);

        let pending = c.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open);
        assert_eq!(c.len(), 3);

        let rejected = four_voters(&c);
        c.submit_vote(&rejected, vote(&rejected, "A", VoteType::Reject)).unwrap();
        c.submit_vote(&rejected, vote(&rejected, "B", VoteType::Reject)).unwrap();
        let stats = c.statistics();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.approval_rate, 50.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_races_votes() {
        let c = ConsensusCoordinator::default();
        let voters: Vec<String> = (0..8).map(|i| format!("agent-{i}")).collect();
        let spec = c.spec("rotate keys", voters.clone()).with_quorum(1.0);
        let id = c.create_request(spec).unwrap().id;
        let mut verdicts = c.subscribe();

        let mut tasks = Vec::new();
        for agent in voters {
            let c = c.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                c.submit_vote(&id, vote(&id, &agent, VoteType::Approve))
            }));
        }
        {
            let c = c.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                c.cancel(&id)
            }));
        }

        let mut finalizers = 0;
        for outcome in join_all(tasks).await {
            match outcome.unwrap() {
                Ok(result) if result.state.is_terminal() => finalizers += 1,
                Ok(_) => {}
                Err(err) => assert!(matches!(err, Error::ConsensusFinalized { .. })),
            }
        }
        assert_eq!(finalizers, 1);

        let verdict = verdicts.recv().await.unwrap();
        assert!(verdict.state.is_terminal());
        assert!(verdicts.try_recv().is_err());
        assert_eq!(c.result(&id).unwrap().state, verdict.state);

        let late = c.submit_vote(&id, vote(&id, "agent-0", VoteType::Reject));
        assert!(matches!(late, Err(Error::ConsensusFinalized { .. })));
        assert!(matches!(c.cancel(&id), Err(Error::ConsensusFinalized { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_finalized() {
        let c = ConsensusCoordinator::default();
        let done = four_voters(&c);
        c.cancel(&done).unwrap();
        let open = four_voters(&c);

        assert_eq!(c.purge_finalized(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(c.purge_finalized(Duration::from_secs(60)), 1);

        assert_eq!(c.len(), 1);
        assert!(matches!(c.result(&done), Err(Error::ConsensusNotFound(_))));
        assert_eq!(c.result(&open).unwrap().state, ConsensusState::Pending);
    }

    #[tokio::test]
    async fn test_tally_is_stable_after_finalization() {
        let c = ConsensusCoordinator::default();
        let id = four_voters(&c);
        c.submit_vote(&id, vote(&id, "A", VoteType::Approve)).unwrap();
        let open = c.tally(&id).unwrap();
        assert_eq!(open.state, ConsensusState::Collecting);

        c.submit_vote(&id, vote(&id, "B", VoteType::Approve)).unwrap();
        let first = c.tally(&id).unwrap();
        let second = c.tally(&id).unwrap();
        assert_eq!(first.decided_at, second.decided_at);
        assert_eq!(first.state, ConsensusState::Approved);
    }
}
