//! Per-request decision pipeline.
//!
//! Runs context verification, trust scoring, rule enforcement and
//! agent consensus in order, reconciles the rule and consensus layers,
//! and writes the outcome with its evidence digests into the audit log
//! in a single append. The append is the one operation whose failure
//! aborts the request: without a receipt no decision takes effect.

use crate::agent::{Agent, ObservedOutcome};
use crate::audit::{AuditError, AuditLog, DecisionReceipt, EntryFields, EvidenceRefs};
use crate::canonical::canonicalize_str;
use crate::config::{ConfigError, EngineConfig};
use crate::consensus::{
    AgentRegistry, ConsensusDecision, ConsensusError, ConsensusOrchestrator, ConsensusRecord,
};
use crate::context::{AccessRequest, ContextVerifier, VerificationReport};
use crate::hasher::Hasher;
use crate::keystore::KeyStore;
use crate::proof::{ProofBackend, ProofError, ProofOrchestrator};
use crate::rules::{ActionKind, RuleEngine, RuleError, RuleOutcome, RuleSet};
use crate::schnorr::SchnorrBackend;
use crate::trust::{
    HistoryRecord, HistoryStore, MemoryHistoryStore, TrustError, TrustScore, TrustScorer,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("proof error: {0}")]
    Proof(#[from] ProofError),

    #[error("rule error: {0}")]
    Rules(#[from] RuleError),

    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("trust error: {0}")]
    Trust(#[from] TrustError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Final graded decision, ordered by strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Permit,
    Monitor,
    Challenge,
    Escalate,
    Deny,
}

impl Decision {
    fn strictness(&self) -> u8 {
        match self {
            Decision::Permit => 0,
            Decision::Monitor => 1,
            Decision::Challenge => 2,
            Decision::Escalate => 3,
            Decision::Deny => 4,
        }
    }
}

impl From<ActionKind> for Decision {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Allow => Decision::Permit,
            ActionKind::Monitor => Decision::Monitor,
            ActionKind::Challenge => Decision::Challenge,
            ActionKind::Escalate => Decision::Escalate,
            ActionKind::Deny => Decision::Deny,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Decision::Permit => "permit",
            Decision::Monitor => "monitor",
            Decision::Challenge => "challenge",
            Decision::Escalate => "escalate",
            Decision::Deny => "deny",
        };
        write!(f, "{name}")
    }
}

/// Defense in depth: the rule layer's deny is absolute, and otherwise
/// the stricter of the two layers wins. Neither layer can grant beyond
/// the other's ceiling.
pub fn reconcile(rule_outcome: &RuleOutcome, consensus: &ConsensusRecord) -> Decision {
    if rule_outcome.kind == ActionKind::Deny {
        return Decision::Deny;
    }
    let rule_decision = Decision::from(rule_outcome.kind);
    let consensus_decision = match consensus.decision {
        ConsensusDecision::Approve => Decision::Permit,
        ConsensusDecision::Deny => Decision::Deny,
    };
    if consensus_decision.strictness() > rule_decision.strictness() {
        consensus_decision
    } else {
        rule_decision
    }
}

/// Everything a caller gets back for one request
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub receipt: DecisionReceipt,
    pub report: VerificationReport,
    pub score: TrustScore,
    pub rule_outcome: RuleOutcome,
    pub consensus: ConsensusRecord,
}

/// Glue over the verification, scoring, rules, consensus and audit
/// subsystems.
pub struct DecisionPipeline {
    verifier: ContextVerifier,
    scorer: TrustScorer,
    engine: RuleEngine,
    registry: AgentRegistry,
    consensus: ConsensusOrchestrator,
    audit: AuditLog,
    history: Arc<dyn HistoryStore>,
    hasher: Hasher,
    history_limit: usize,
}

impl DecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: ContextVerifier,
        scorer: TrustScorer,
        engine: RuleEngine,
        registry: AgentRegistry,
        consensus: ConsensusOrchestrator,
        audit: AuditLog,
        history: Arc<dyn HistoryStore>,
        hasher: Hasher,
        history_limit: usize,
    ) -> Self {
        DecisionPipeline {
            verifier,
            scorer,
            engine,
            registry,
            consensus,
            audit,
            history,
            hasher,
            history_limit,
        }
    }

    /// Assemble the pipeline from a validated configuration with the
    /// built-in Schnorr backend and an in-memory history store.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let backends: Vec<Arc<dyn ProofBackend>> = vec![Arc::new(SchnorrBackend::new())];
        Self::from_config_with(config, backends, None)
    }

    /// Assemble with caller-supplied proof backends and an optional
    /// keystore for signed checkpoints and consensus records.
    pub fn from_config_with(
        config: EngineConfig,
        backends: Vec<Arc<dyn ProofBackend>>,
        keystore: Option<Arc<dyn KeyStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let hasher = Hasher::new(config.hash_algorithm);

        let mut orchestrator = ProofOrchestrator::new(
            Duration::from_millis(config.per_component_timeout_ms),
            config.backend_sessions,
        );
        for backend in backends {
            orchestrator.register_backend(backend)?;
        }
        for (circuit, backend) in &config.proof_backends {
            orchestrator.set_route(circuit, backend)?;
        }

        let verifier = ContextVerifier::new(
            Arc::new(orchestrator),
            config.component_confidences.clone(),
            hasher,
        );
        let scorer = TrustScorer::new(config.trust_weights, config.trust_thresholds)?;
        let engine = RuleEngine::new(RuleSet::new(config.rules.clone())?);

        let mut registry = AgentRegistry::new();
        for spec in &config.agents {
            registry.register(Agent::new(&spec.id, spec.role, spec.weight))?;
        }
        let mut consensus = ConsensusOrchestrator::new(
            registry.handles(),
            config.quorum_policy,
            Duration::from_millis(config.per_agent_timeout_ms),
            hasher,
        );
        if let Some(keystore) = &keystore {
            consensus = consensus.with_keystore(Arc::clone(keystore));
        }

        let audit = match keystore {
            Some(keystore) => {
                AuditLog::with_keystore(&config.audit_log_path, hasher, keystore)?
            }
            None => AuditLog::open(&config.audit_log_path, hasher)?,
        }
        .with_append_timeout(Duration::from_millis(config.append_timeout_ms));

        Ok(DecisionPipeline::new(
            verifier,
            scorer,
            engine,
            registry,
            consensus,
            audit,
            Arc::new(MemoryHistoryStore::default()),
            hasher,
            config.history_limit,
        ))
    }

    /// Swap the history store (e.g. for a persistent backend).
    pub fn with_history_store(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Decide one request.
    ///
    /// Sub-operation failures (proof timeouts, scorer errors) flow
    /// through as data; only a failed audit append aborts, in which
    /// case no decision takes effect.
    pub fn decide(&self, request: &AccessRequest) -> Result<DecisionOutcome> {
        let report = self.verifier.verify(request);

        let history = self.history.lookup(&request.principal, self.history_limit);
        let history = if history.is_empty() {
            None
        } else {
            Some(history)
        };
        let score = self
            .scorer
            .score(&report, history.as_deref(), &request.context_data);

        let rule_outcome = self.engine.enforce(request, &score, &report);
        let consensus = self.consensus.decide(request, &report, &score, &rule_outcome);
        let decision = reconcile(&rule_outcome, &consensus);

        let evidence = EvidenceRefs {
            verification_report: hex::encode(report.digest(&self.hasher)),
            rule_outcome: hex::encode(rule_outcome.digest(&self.hasher)),
            consensus_record: hex::encode(consensus.digest(&self.hasher)),
        };

        let mut fields = EntryFields::new("access_decision")
            .with_actor(canonicalize_str(&request.principal))
            .with_resource(canonicalize_str(&request.resource))
            .with_action(canonicalize_str(&request.action))
            .with_decision(decision.to_string())
            .with_evidence(evidence)
            .with_rule_id(rule_outcome.rule_id.clone());

        let mut errors: Vec<String> = report
            .per_component
            .iter()
            .filter_map(|(component, outcome)| {
                outcome.error.as_ref().map(|e| format!("{component}: {e}"))
            })
            .collect();
        if let Some(e) = &score.error {
            errors.push(format!("trust: {e}"));
        }
        if !errors.is_empty() {
            fields = fields.with_error(errors.join("; "));
        }

        // Audit append is the commit point.
        let receipt = self.audit.append(fields)?;

        let anomalous = request.context_data.get("risk_level").and_then(Value::as_str)
            == Some("high")
            || decision == Decision::Escalate;

        self.history.record(
            &request.principal,
            HistoryRecord {
                timestamp: Utc::now(),
                decision: decision.to_string(),
                success: decision == Decision::Permit,
                anomalous,
            },
        );
        self.consensus.observe_all(&ObservedOutcome {
            decision: decision.to_string(),
            anomalous,
            observed_at: Utc::now(),
        });

        info!(
            request_id = %request.request_id,
            principal = %request.principal,
            decision = %decision,
            sequence_no = receipt.audit_sequence_no,
            "decision recorded"
        );

        Ok(DecisionOutcome {
            decision,
            receipt,
            report,
            score,
            rule_outcome,
            consensus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::QuorumPolicy;
    use std::collections::BTreeMap;

    fn consensus_record(decision: ConsensusDecision) -> ConsensusRecord {
        ConsensusRecord {
            request_id: "req-test".to_string(),
            votes: Vec::new(),
            quorum_policy: QuorumPolicy::SimpleMajority,
            decision,
            confidence: 1.0,
            reason: String::new(),
            elapsed_ns: 0,
            signature: None,
        }
    }

    fn outcome(kind: ActionKind) -> RuleOutcome {
        RuleOutcome {
            kind,
            rule_id: "r".to_string(),
            reason: String::new(),
            parameters: BTreeMap::new(),
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn test_rule_deny_is_absolute() {
        let final_decision = reconcile(
            &outcome(ActionKind::Deny),
            &consensus_record(ConsensusDecision::Approve),
        );
        assert_eq!(final_decision, Decision::Deny);
    }

    #[test]
    fn test_consensus_can_tighten_but_not_soften() {
        // Rule says challenge, consensus approves: challenge stands.
        assert_eq!(
            reconcile(
                &outcome(ActionKind::Challenge),
                &consensus_record(ConsensusDecision::Approve)
            ),
            Decision::Challenge
        );
        // Rule allows, consensus denies: deny wins.
        assert_eq!(
            reconcile(
                &outcome(ActionKind::Allow),
                &consensus_record(ConsensusDecision::Deny)
            ),
            Decision::Deny
        );
        // Both permissive: permit.
        assert_eq!(
            reconcile(
                &outcome(ActionKind::Allow),
                &consensus_record(ConsensusDecision::Approve)
            ),
            Decision::Permit
        );
    }

    #[test]
    fn test_strictness_ordering() {
        let ordered = [
            Decision::Permit,
            Decision::Monitor,
            Decision::Challenge,
            Decision::Escalate,
            Decision::Deny,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].strictness() < pair[1].strictness());
        }
    }
}
