//! Policy-biased evaluator agents.
//!
//! Each agent applies its role's trust threshold to cast a weighted
//! vote. Agents are long-lived and keep a bounded window of the
//! decisions they observed; the watchdog role uses that window to flip
//! to deny under elevated risk. Agents never read each other's state.

use crate::context::{AccessRequest, VerificationReport};
use crate::rules::RuleOutcome;
use crate::trust::TrustScore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Default size of an agent's observation window
pub const DEFAULT_OBSERVATION_WINDOW: usize = 100;

/// Anomaly share in the observed window beyond which the watchdog
/// refuses to approve
const WATCHDOG_ANOMALY_LIMIT: f64 = 0.3;

/// Policy bias of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Strict,
    Neutral,
    Permissive,
    Watchdog,
}

impl AgentRole {
    /// Trust value at which the role flips from deny to approve
    pub fn approval_threshold(&self) -> f64 {
        match self {
            AgentRole::Strict => 0.8,
            AgentRole::Neutral => 0.6,
            AgentRole::Permissive => 0.45,
            AgentRole::Watchdog => 0.6,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentRole::Strict => "strict",
            AgentRole::Neutral => "neutral",
            AgentRole::Permissive => "permissive",
            AgentRole::Watchdog => "watchdog",
        };
        write!(f, "{name}")
    }
}

/// Vote choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Deny,
    Abstain,
}

/// A single agent's vote on a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    pub choice: VoteChoice,
    pub confidence: f64,
    pub justification: String,
}

impl Vote {
    /// Abstention cast on behalf of an agent that produced no vote
    pub fn abstain(agent_id: impl Into<String>, justification: impl Into<String>) -> Self {
        Vote {
            agent_id: agent_id.into(),
            choice: VoteChoice::Abstain,
            confidence: 0.0,
            justification: justification.into(),
        }
    }
}

/// A finalized decision fed back to the agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedOutcome {
    pub decision: String,
    pub anomalous: bool,
    pub observed_at: DateTime<Utc>,
}

/// Stateful evaluator with a policy bias.
///
/// Internal state mutates only through `observe`, which the consensus
/// orchestrator calls in a single serialized stream per agent.
pub struct Agent {
    id: String,
    role: AgentRole,
    weight: f64,
    window_capacity: usize,
    window: Mutex<VecDeque<ObservedOutcome>>,
}

impl Agent {
    pub fn new(id: impl Into<String>, role: AgentRole, weight: f64) -> Self {
        Agent {
            id: id.into(),
            role,
            weight: weight.clamp(0.0, 1.0),
            window_capacity: DEFAULT_OBSERVATION_WINDOW,
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Cast a vote on the request.
    ///
    /// The vote flips on the role's trust threshold; the watchdog
    /// additionally denies outright under declared high risk or when
    /// its observed anomaly rate runs hot. Confidence measures distance
    /// from the flip point.
    pub fn evaluate(
        &self,
        request: &AccessRequest,
        _report: &VerificationReport,
        score: &TrustScore,
        rule_outcome: &RuleOutcome,
    ) -> Vote {
        let threshold = self.role.approval_threshold();

        if self.role == AgentRole::Watchdog {
            let declared_high_risk = request
                .context_data
                .get("risk_level")
                .and_then(Value::as_str)
                == Some("high");
            if declared_high_risk {
                return Vote {
                    agent_id: self.id.clone(),
                    choice: VoteChoice::Deny,
                    confidence: 1.0,
                    justification: "watchdog: risk_level high".to_string(),
                };
            }

            let anomaly_rate = self.anomaly_rate();
            if anomaly_rate > WATCHDOG_ANOMALY_LIMIT {
                return Vote {
                    agent_id: self.id.clone(),
                    choice: VoteChoice::Deny,
                    confidence: 1.0,
                    justification: format!(
                        "watchdog: observed anomaly rate {anomaly_rate:.2} exceeds {WATCHDOG_ANOMALY_LIMIT}"
                    ),
                };
            }
        }

        let approve = score.value >= threshold;
        let confidence = ((score.value - threshold).abs() * 2.0).min(1.0);
        let comparison = if approve { ">=" } else { "<" };
        let justification = format!(
            "{}: trust {:.3} {} threshold {:.2}; rule outcome {}",
            self.role, score.value, comparison, threshold, rule_outcome.kind
        );

        Vote {
            agent_id: self.id.clone(),
            choice: if approve {
                VoteChoice::Approve
            } else {
                VoteChoice::Deny
            },
            confidence,
            justification,
        }
    }

    /// Record a finalized decision into the sliding window.
    pub fn observe(&self, outcome: ObservedOutcome) {
        let mut window = self.window.lock();
        window.push_back(outcome);
        while window.len() > self.window_capacity {
            window.pop_front();
        }
    }

    /// Share of anomalous outcomes in the observed window
    pub fn anomaly_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 0.0;
        }
        let anomalies = window.iter().filter(|o| o.anomalous).count();
        anomalies as f64 / window.len() as f64
    }

    pub fn observed_count(&self) -> usize {
        self.window.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextComponent;
    use crate::rules::ActionKind;
    use crate::trust::{TrustFactors, TrustLevel};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn request() -> AccessRequest {
        AccessRequest::new("alice", "/vault/1", "read")
    }

    fn high_risk_request() -> AccessRequest {
        AccessRequest::new("mallory", "/vault/1", "read")
            .with_context("risk_level", json!("high"))
    }

    fn report() -> VerificationReport {
        VerificationReport {
            request_id: "req-test".to_string(),
            per_component: BTreeMap::<ContextComponent, _>::new(),
            verified: true,
            aggregate_confidence: 0.8,
            completed_at: Utc::now(),
            artifacts: Vec::new(),
        }
    }

    fn score(value: f64) -> TrustScore {
        TrustScore {
            value,
            level: TrustLevel::Medium,
            factors: TrustFactors::default(),
            explanation: String::new(),
            computed_at: Utc::now(),
            error: None,
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
    fn test_role_thresholds_split_at_055() {
        let strict = Agent::new("strict-1", AgentRole::Strict, 1.0);
        let neutral = Agent::new("neutral-1", AgentRole::Neutral, 1.0);
        let permissive = Agent::new("permissive-1", AgentRole::Permissive, 1.0);

        let s = score(0.55);
        let allow = outcome(ActionKind::Allow);

        assert_eq!(
            strict.evaluate(&request(), &report(), &s, &allow).choice,
            VoteChoice::Deny
        );
        assert_eq!(
            neutral.evaluate(&request(), &report(), &s, &allow).choice,
            VoteChoice::Deny
        );
        assert_eq!(
            permissive.evaluate(&request(), &report(), &s, &allow).choice,
            VoteChoice::Approve
        );
    }

    #[test]
    fn test_watchdog_denies_high_risk_regardless_of_trust() {
        let watchdog = Agent::new("watchdog-1", AgentRole::Watchdog, 1.0);
        let vote = watchdog.evaluate(
            &high_risk_request(),
            &report(),
            &score(0.99),
            &outcome(ActionKind::Allow),
        );
        assert_eq!(vote.choice, VoteChoice::Deny);
        assert!(vote.justification.contains("risk_level high"));
    }

    #[test]
    fn test_watchdog_denies_on_hot_anomaly_window() {
        let watchdog = Agent::new("watchdog-1", AgentRole::Watchdog, 1.0);
        for i in 0..10 {
            watchdog.observe(ObservedOutcome {
                decision: "deny".to_string(),
                anomalous: i < 4,
                observed_at: Utc::now(),
            });
        }
        assert!(watchdog.anomaly_rate() > 0.3);

        let vote = watchdog.evaluate(
            &request(),
            &report(),
            &score(0.9),
            &outcome(ActionKind::Allow),
        );
        assert_eq!(vote.choice, VoteChoice::Deny);
    }

    #[test]
    fn test_watchdog_behaves_neutral_otherwise() {
        let watchdog = Agent::new("watchdog-1", AgentRole::Watchdog, 1.0);
        let vote = watchdog.evaluate(
            &request(),
            &report(),
            &score(0.7),
            &outcome(ActionKind::Allow),
        );
        assert_eq!(vote.choice, VoteChoice::Approve);
    }

    #[test]
    fn test_confidence_grows_with_distance_from_threshold() {
        let neutral = Agent::new("neutral-1", AgentRole::Neutral, 1.0);
        let near = neutral.evaluate(&request(), &report(), &score(0.61), &outcome(ActionKind::Allow));
        let far = neutral.evaluate(&request(), &report(), &score(0.95), &outcome(ActionKind::Allow));
        assert!(far.confidence > near.confidence);
        assert!(far.confidence <= 1.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let agent = Agent::new("a", AgentRole::Neutral, 1.0).with_window_capacity(5);
        for _ in 0..12 {
            agent.observe(ObservedOutcome {
                decision: "permit".to_string(),
                anomalous: false,
                observed_at: Utc::now(),
            });
        }
        assert_eq!(agent.observed_count(), 5);
    }

    #[test]
    fn test_weight_clamped() {
        assert_eq!(Agent::new("a", AgentRole::Neutral, 3.0).weight(), 1.0);
        assert_eq!(Agent::new("b", AgentRole::Neutral, -1.0).weight(), 0.0);
    }

    #[test]
    fn test_justification_is_deterministic() {
        let agent = Agent::new("neutral-1", AgentRole::Neutral, 1.0);
        let a = agent.evaluate(&request(), &report(), &score(0.42), &outcome(ActionKind::Deny));
        let b = agent.evaluate(&request(), &report(), &score(0.42), &outcome(ActionKind::Deny));
        assert_eq!(a.justification, b.justification);
        assert_eq!(a.justification, "neutral: trust 0.420 < threshold 0.60; rule outcome deny");
    }
}
