//! Multi-agent consensus.
//!
//! The orchestrator fans a request out to every live agent in
//! parallel, bounds each evaluation by a deadline, and aggregates the
//! weighted votes under the configured quorum policy. Collection stops
//! early once the outcome can no longer change. The resulting record
//! carries every vote and, when a keystore is configured, a detached
//! signature over its canonical bytes.

use crate::agent::{Agent, ObservedOutcome, Vote, VoteChoice};
use crate::canonical;
use crate::context::{AccessRequest, VerificationReport};
use crate::hasher::{Hash, Hasher};
use crate::keystore::{verify_detached, KeyStore};
use crate::rules::RuleOutcome;
use crate::trust::TrustScore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{mpsc, Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("duplicate agent id: {0}")]
    DuplicateAgent(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Decision rule converting weighted votes into one outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    #[default]
    SimpleMajority,
    #[serde(rename = "supermajority_2_3")]
    Supermajority23,
    StrictUnanimous,
}

/// Share a choice must reach under the supermajority policy
pub const SUPERMAJORITY_SHARE: f64 = 2.0 / 3.0;

/// Consensus verdict on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDecision {
    Approve,
    Deny,
}

/// One agent's vote as recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub agent_id: String,
    pub choice: VoteChoice,
    pub confidence: f64,
    pub weight: f64,
    pub justification: String,
}

/// Detached signature over a record's canonical bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSignature {
    pub digest: String,
    pub signature: String,
    pub signer_pubkey: String,
}

/// Full consensus outcome: votes, verdict, confidence, reasoning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub request_id: String,
    pub votes: Vec<VoteRecord>,
    pub quorum_policy: QuorumPolicy,
    pub decision: ConsensusDecision,
    pub confidence: f64,
    pub reason: String,
    pub elapsed_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<RecordSignature>,
}

impl ConsensusRecord {
    /// Digest over the canonical record bytes with the signature field
    /// stripped
    pub fn digest(&self, hasher: &Hasher) -> Hash {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let bytes = canonical::canonical_bytes(&unsigned).unwrap_or_default();
        hasher.digest(&bytes)
    }

    /// Check the attached signature, if any, against the record bytes.
    pub fn verify_signature(&self, hasher: &Hasher) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let digest = self.digest(hasher);
        if signature.digest != hex::encode(digest) {
            return false;
        }
        use base64::Engine as _;
        let Ok(sig) = base64::engine::general_purpose::STANDARD.decode(&signature.signature)
        else {
            return false;
        };
        let Ok(pk) = hex::decode(&signature.signer_pubkey) else {
            return false;
        };
        verify_detached(&pk, &digest, &sig).is_ok()
    }
}

/// Owns the agents; everything else holds weak handles.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry { agents: Vec::new() }
    }

    pub fn register(&mut self, agent: Agent) -> Result<Arc<Agent>> {
        if self.agents.iter().any(|a| a.id() == agent.id()) {
            return Err(ConsensusError::DuplicateAgent(agent.id().to_string()));
        }
        let agent = Arc::new(agent);
        self.agents.push(Arc::clone(&agent));
        Ok(agent)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.id() == agent_id).cloned()
    }

    pub fn handles(&self) -> Vec<Weak<Agent>> {
        self.agents.iter().map(Arc::downgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Fans requests out to agents and aggregates their votes.
pub struct ConsensusOrchestrator {
    agents: Vec<Weak<Agent>>,
    policy: QuorumPolicy,
    per_agent_timeout: Duration,
    hasher: Hasher,
    keystore: Option<Arc<dyn KeyStore>>,
}

impl ConsensusOrchestrator {
    pub fn new(
        agents: Vec<Weak<Agent>>,
        policy: QuorumPolicy,
        per_agent_timeout: Duration,
        hasher: Hasher,
    ) -> Self {
        ConsensusOrchestrator {
            agents,
            policy,
            per_agent_timeout,
            hasher,
            keystore: None,
        }
    }

    pub fn with_keystore(mut self, keystore: Arc<dyn KeyStore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    /// Poll the agents and issue a consensus record.
    ///
    /// Agent evaluations run in parallel; an agent missing its deadline
    /// contributes an abstention with zero confidence. Fewer than two
    /// live agents is a degraded fan-out and denies outright.
    pub fn decide(
        &self,
        request: &AccessRequest,
        report: &VerificationReport,
        score: &TrustScore,
        rule_outcome: &RuleOutcome,
    ) -> ConsensusRecord {
        let started = Instant::now();
        let live = self.select_agents(request);

        if live.len() < 2 {
            warn!(
                request_id = %request.request_id,
                live = live.len(),
                "degraded consensus: fewer than two live agents"
            );
            let record = ConsensusRecord {
                request_id: request.request_id.clone(),
                votes: Vec::new(),
                quorum_policy: self.policy,
                decision: ConsensusDecision::Deny,
                confidence: 0.0,
                reason: "degraded_consensus".to_string(),
                elapsed_ns: started.elapsed().as_nanos() as u64,
                signature: None,
            };
            return self.finalize(record);
        }

        let request_arc = Arc::new(request.clone());
        let report_arc = Arc::new(report.clone());
        let score_arc = Arc::new(score.clone());
        let rule_arc = Arc::new(rule_outcome.clone());

        let (tx, rx) = mpsc::channel::<(usize, Vote)>();
        for (i, agent) in live.iter().enumerate() {
            let agent = Arc::clone(agent);
            let tx = tx.clone();
            let request = Arc::clone(&request_arc);
            let report = Arc::clone(&report_arc);
            let score = Arc::clone(&score_arc);
            let rule = Arc::clone(&rule_arc);
            std::thread::spawn(move || {
                let vote = agent.evaluate(&request, &report, &score, &rule);
                let _ = tx.send((i, vote));
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.per_agent_timeout;
        let mut votes: Vec<Option<Vote>> = vec![None; live.len()];
        let mut received = 0usize;
        let mut settled_early = false;

        while received < live.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((i, vote)) => {
                    if votes[i].is_none() {
                        votes[i] = Some(vote);
                        received += 1;
                    }
                    if received < live.len() && self.outcome_settled(&live, &votes) {
                        settled_early = true;
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let missing_reason = if settled_early {
            "not awaited: outcome already settled"
        } else {
            "timeout"
        };

        let vote_records: Vec<VoteRecord> = live
            .iter()
            .zip(votes)
            .map(|(agent, vote)| {
                let vote = vote.unwrap_or_else(|| Vote::abstain(agent.id(), missing_reason));
                VoteRecord {
                    agent_id: vote.agent_id,
                    choice: vote.choice,
                    confidence: vote.confidence,
                    weight: agent.weight(),
                    justification: vote.justification,
                }
            })
            .collect();

        let (decision, confidence, reason) = self.aggregate(&vote_records);

        info!(
            request_id = %request.request_id,
            decision = ?decision,
            confidence,
            votes = vote_records.len(),
            "consensus reached"
        );

        let record = ConsensusRecord {
            request_id: request.request_id.clone(),
            votes: vote_records,
            quorum_policy: self.policy,
            decision,
            confidence,
            reason,
            elapsed_ns: started.elapsed().as_nanos() as u64,
            signature: None,
        };
        self.finalize(record)
    }

    /// Push the finalized decision into every agent's observation
    /// window. Calls are serialized per agent.
    pub fn observe_all(&self, outcome: &ObservedOutcome) {
        for agent in self.agents.iter().filter_map(Weak::upgrade) {
            agent.observe(outcome.clone());
        }
    }

    /// Live agents, optionally narrowed by a `metadata.agents` id list
    /// on the request.
    fn select_agents(&self, request: &AccessRequest) -> Vec<Arc<Agent>> {
        let filter: Option<Vec<&str>> = request.metadata.get("agents").and_then(|v| {
            v.as_array()
                .map(|ids| ids.iter().filter_map(Value::as_str).collect())
        });

        self.agents
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|agent| match &filter {
                Some(ids) => ids.contains(&agent.id()),
                None => true,
            })
            .collect()
    }

    /// Whether the outstanding votes can still change the outcome. The
    /// check simulates every extreme assignment of the pending agents;
    /// if all extremes agree, further waiting is pointless.
    fn outcome_settled(&self, live: &[Arc<Agent>], votes: &[Option<Vote>]) -> bool {
        let decided: Vec<(VoteChoice, f64)> = live
            .iter()
            .zip(votes)
            .filter_map(|(agent, vote)| vote.as_ref().map(|v| (v.choice, agent.weight())))
            .collect();
        let pending: Vec<f64> = live
            .iter()
            .zip(votes)
            .filter(|(_, vote)| vote.is_none())
            .map(|(agent, _)| agent.weight())
            .collect();

        if pending.is_empty() {
            return false;
        }

        let mut outcomes = Vec::with_capacity(3);
        for fill in [VoteChoice::Approve, VoteChoice::Deny, VoteChoice::Abstain] {
            let mut extended = decided.clone();
            extended.extend(pending.iter().map(|&w| (fill, w)));
            outcomes.push(self.aggregate_weighted(&extended).0);
        }
        outcomes.windows(2).all(|pair| pair[0] == pair[1])
    }

    fn aggregate(&self, votes: &[VoteRecord]) -> (ConsensusDecision, f64, String) {
        let weighted: Vec<(VoteChoice, f64)> =
            votes.iter().map(|v| (v.choice, v.weight)).collect();
        let (decision, confidence) = self.aggregate_weighted(&weighted);

        let non_abstain: f64 = weighted
            .iter()
            .filter(|(c, _)| *c != VoteChoice::Abstain)
            .map(|(_, w)| w)
            .sum();
        let approve: f64 = weighted
            .iter()
            .filter(|(c, _)| *c == VoteChoice::Approve)
            .map(|(_, w)| w)
            .sum();
        let reason = format!(
            "approve weight {:.3}, deny weight {:.3}, abstain weight {:.3}",
            approve,
            non_abstain - approve,
            weighted.iter().map(|(_, w)| w).sum::<f64>() - non_abstain,
        );
        (decision, confidence, reason)
    }

    /// Deterministic aggregation of `(choice, weight)` pairs under the
    /// quorum policy. When no choice reaches the required share the
    /// decision is deny.
    fn aggregate_weighted(&self, votes: &[(VoteChoice, f64)]) -> (ConsensusDecision, f64) {
        let total: f64 = votes.iter().map(|(_, w)| w).sum();
        let approve_w: f64 = votes
            .iter()
            .filter(|(c, _)| *c == VoteChoice::Approve)
            .map(|(_, w)| w)
            .sum();
        let deny_w: f64 = votes
            .iter()
            .filter(|(c, _)| *c == VoteChoice::Deny)
            .map(|(_, w)| w)
            .sum();
        let approve_count = votes
            .iter()
            .filter(|(c, _)| *c == VoteChoice::Approve)
            .count();
        let deny_count = votes.iter().filter(|(c, _)| *c == VoteChoice::Deny).count();
        let non_abstain = approve_w + deny_w;

        let winner = if non_abstain <= 0.0 {
            None
        } else {
            match self.policy {
                QuorumPolicy::SimpleMajority => {
                    if approve_w > non_abstain / 2.0 {
                        Some(ConsensusDecision::Approve)
                    } else if deny_w > non_abstain / 2.0 {
                        Some(ConsensusDecision::Deny)
                    } else {
                        None
                    }
                }
                QuorumPolicy::Supermajority23 => {
                    if approve_w / non_abstain >= SUPERMAJORITY_SHARE {
                        Some(ConsensusDecision::Approve)
                    } else if deny_w / non_abstain >= SUPERMAJORITY_SHARE {
                        Some(ConsensusDecision::Deny)
                    } else {
                        None
                    }
                }
                QuorumPolicy::StrictUnanimous => {
                    if approve_count > 0 && deny_count == 0 {
                        Some(ConsensusDecision::Approve)
                    } else if deny_count > 0 && approve_count == 0 {
                        Some(ConsensusDecision::Deny)
                    } else {
                        None
                    }
                }
            }
        };

        let (decision, winning_weight) = match winner {
            Some(ConsensusDecision::Approve) => (ConsensusDecision::Approve, approve_w),
            Some(ConsensusDecision::Deny) => (ConsensusDecision::Deny, deny_w),
            None => (ConsensusDecision::Deny, deny_w),
        };

        let confidence = if non_abstain > 0.0 && total > 0.0 {
            (winning_weight / non_abstain) * (non_abstain / total).min(1.0)
        } else {
            0.0
        };

        (decision, confidence)
    }

    fn finalize(&self, mut record: ConsensusRecord) -> ConsensusRecord {
        if let Some(keystore) = &self.keystore {
            let digest = record.digest(&self.hasher);
            match keystore.sign(&digest) {
                Ok(signature) => {
                    use base64::Engine as _;
                    record.signature = Some(RecordSignature {
                        digest: hex::encode(digest),
                        signature: base64::engine::general_purpose::STANDARD.encode(signature),
                        signer_pubkey: hex::encode(keystore.public_key_bytes()),
                    });
                }
                Err(e) => warn!(error = %e, "consensus record signing failed"),
            }
        }
        record
    }
}
