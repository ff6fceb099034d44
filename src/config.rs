//! Engine configuration.
//!
//! Everything tunable is parsed once at startup and validated as a
//! whole; a bad configuration never reaches the runtime path.

use crate::agent::AgentRole;
use crate::consensus::QuorumPolicy;
use crate::context::ContextComponent;
use crate::hasher::HashAlgorithm;
use crate::rules::Rule;
use crate::trust::{TrustThresholds, TrustWeights};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Declared agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub role: AgentRole,
    pub weight: f64,
}

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    pub audit_log_path: PathBuf,

    /// `circuit_id -> backend_id` route overrides. Circuits not listed
    /// stay routed to the backend that declared them.
    #[serde(default)]
    pub proof_backends: BTreeMap<String, String>,

    #[serde(default)]
    pub trust_weights: TrustWeights,

    #[serde(default)]
    pub trust_thresholds: TrustThresholds,

    #[serde(default)]
    pub rules: Vec<Rule>,

    pub agents: Vec<AgentSpec>,

    #[serde(default)]
    pub quorum_policy: QuorumPolicy,

    #[serde(default = "default_component_confidences")]
    pub component_confidences: BTreeMap<ContextComponent, f64>,

    #[serde(default = "default_component_timeout_ms")]
    pub per_component_timeout_ms: u64,

    #[serde(default = "default_agent_timeout_ms")]
    pub per_agent_timeout_ms: u64,

    #[serde(default = "default_append_timeout_ms")]
    pub append_timeout_ms: u64,

    /// Bounded prover session pool size
    #[serde(default = "default_backend_sessions")]
    pub backend_sessions: usize,

    /// Records consulted per principal when scoring
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_component_confidences() -> BTreeMap<ContextComponent, f64> {
    BTreeMap::from([
        (ContextComponent::DeviceFingerprint, 0.9),
        (ContextComponent::Timestamp, 0.7),
        (ContextComponent::Location, 0.8),
        (ContextComponent::AccessPattern, 0.6),
    ])
}

fn default_component_timeout_ms() -> u64 {
    2_000
}

fn default_agent_timeout_ms() -> u64 {
    1_000
}

fn default_append_timeout_ms() -> u64 {
    5_000
}

fn default_backend_sessions() -> usize {
    8
}

fn default_history_limit() -> usize {
    50
}

impl EngineConfig {
    /// Minimal workable configuration for the given log path.
    pub fn with_audit_path(path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            hash_algorithm: HashAlgorithm::default(),
            audit_log_path: path.into(),
            proof_backends: BTreeMap::new(),
            trust_weights: TrustWeights::default(),
            trust_thresholds: TrustThresholds::default(),
            rules: Vec::new(),
            agents: vec![
                AgentSpec {
                    id: "strict-1".to_string(),
                    role: AgentRole::Strict,
                    weight: 1.0,
                },
                AgentSpec {
                    id: "neutral-1".to_string(),
                    role: AgentRole::Neutral,
                    weight: 1.0,
                },
                AgentSpec {
                    id: "permissive-1".to_string(),
                    role: AgentRole::Permissive,
                    weight: 1.0,
                },
            ],
            quorum_policy: QuorumPolicy::default(),
            component_confidences: default_component_confidences(),
            per_component_timeout_ms: default_component_timeout_ms(),
            per_agent_timeout_ms: default_agent_timeout_ms(),
            append_timeout_ms: default_append_timeout_ms(),
            backend_sessions: default_backend_sessions(),
            history_limit: default_history_limit(),
        }
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: EngineConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration as a whole.
    pub fn validate(&self) -> Result<()> {
        self.trust_weights
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.trust_thresholds
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut rule_ids = BTreeSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(&rule.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate rule id {}",
                    rule.id
                )));
            }
        }

        if self.agents.is_empty() {
            return Err(ConfigError::Invalid("no agents configured".into()));
        }
        let mut agent_ids = BTreeSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(&agent.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent id {}",
                    agent.id
                )));
            }
            if !(0.0..=1.0).contains(&agent.weight) {
                return Err(ConfigError::Invalid(format!(
                    "agent {} weight {} outside [0, 1]",
                    agent.id, agent.weight
                )));
            }
        }

        for (component, confidence) in &self.component_confidences {
            if !(0.0..=1.0).contains(confidence) {
                return Err(ConfigError::Invalid(format!(
                    "component {component} confidence {confidence} outside [0, 1]"
                )));
            }
        }

        if self.backend_sessions == 0 {
            return Err(ConfigError::Invalid("backend_sessions must be > 0".into()));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be > 0".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> EngineConfig {
        EngineConfig::with_audit_path("/tmp/audit.log")
    }

    #[test]
    fn test_default_config_validates() {
        base().validate().unwrap();
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let mut config = base();
        config.agents.push(AgentSpec {
            id: "strict-1".to_string(),
            role: AgentRole::Watchdog,
            weight: 0.5,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut config = base();
        config.trust_weights.context = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_confidence_rejected() {
        let mut config = base();
        config
            .component_confidences
            .insert(ContextComponent::Location, 1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_full_json_parse() {
        let raw = json!({
            "hash_algorithm": "sha3_256",
            "audit_log_path": "/var/lib/aegis/audit.log",
            "proof_backends": {"device_proof": "schnorr-ristretto"},
            "trust_weights": {
                "context": 0.3, "behavioral": 0.25, "risk": 0.2,
                "consistency": 0.15, "recency": 0.1
            },
            "trust_thresholds": {
                "very_high": 0.9, "high": 0.7, "medium": 0.5, "low": 0.3
            },
            "rules": [{
                "id": "low_trust_deny",
                "priority": 1,
                "conditions": [
                    {"field_path": "trust_score", "operator": "le", "literal": 0.5}
                ],
                "actions": [{"kind": "deny", "parameters": {"reason": "Low trust user"}}]
            }],
            "agents": [
                {"id": "strict-1", "role": "strict", "weight": 1.0},
                {"id": "watchdog-1", "role": "watchdog", "weight": 0.8}
            ],
            "quorum_policy": "supermajority_2_3",
            "component_confidences": {
                "device_fingerprint": 0.9,
                "timestamp": 0.7
            },
            "per_component_timeout_ms": 1500,
            "per_agent_timeout_ms": 800,
            "append_timeout_ms": 3000
        });

        let config: EngineConfig = serde_json::from_value(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha3_256);
        assert_eq!(config.quorum_policy, QuorumPolicy::Supermajority23);
        assert_eq!(config.agents[1].role, AgentRole::Watchdog);
        assert_eq!(
            config.component_confidences[&ContextComponent::Timestamp],
            0.7
        );
        // Unlisted fields fall back to defaults.
        assert_eq!(config.backend_sessions, 8);
    }

    #[test]
    fn test_missing_agents_rejected() {
        let mut config = base();
        config.agents.clear();
        assert!(config.validate().is_err());
    }
}
