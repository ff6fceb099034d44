//! # Aegis Core - Context-Aware Cryptographic Access Control
//!
//! Aegis decides access requests from verifiable context rather than
//! static credentials. For every request it:
//!
//! - verifies contextual claims (device, time, location, behavior)
//!   through zero-knowledge proof backends,
//! - computes a dynamic trust score from the verified context and the
//!   principal's history,
//! - runs a priority-ordered rule engine over the request namespace,
//! - polls a council of policy-biased agents and aggregates their
//!   weighted votes under a quorum policy,
//! - records the decision and its evidence digests in an append-only
//!   Merkle audit log, returning a tamper-evident receipt.
//!
//! ## Core Philosophy
//!
//! **"Every decision carries a proof; every proof lands in the log."**
//!
//! - Requests may be denied, but never silently decided
//! - Either the rule layer or the agent council can deny; neither can
//!   grant beyond the other's ceiling
//! - The audit root is the single anchor a verifier needs
//!
//! ## Example
//!
//! ```no_run
//! use aegis_core::*;
//! use std::collections::BTreeMap;
//!
//! let config = EngineConfig::with_audit_path("./aegis-audit.log");
//! let pipeline = DecisionPipeline::from_config(config).unwrap();
//!
//! let mut inputs = BTreeMap::new();
//! inputs.insert("device_fingerprint".to_string(), serde_json::json!("fp-1f08"));
//! let request = AccessRequest::new("alice", "/vault/designs", "read")
//!     .with_claim(ContextClaim::new(ContextComponent::DeviceFingerprint, inputs));
//!
//! let outcome = pipeline.decide(&request).unwrap();
//! println!("{} -> {}", outcome.decision, outcome.receipt.audit_root_after);
//! ```

pub mod agent;
pub mod audit;
pub mod canonical;
pub mod config;
pub mod consensus;
pub mod context;
pub mod hasher;
pub mod keystore;
pub mod merkle;
pub mod pipeline;
pub mod proof;
pub mod rules;
pub mod schnorr;
pub mod trust;

// Re-export main types
pub use agent::{Agent, AgentRole, ObservedOutcome, Vote, VoteChoice};
pub use audit::{
    AuditEntry, AuditError, AuditLog, DecisionReceipt, EntryFields, EvidenceRefs,
};
pub use canonical::{canonical_json_bytes, canonicalize_str};
pub use config::{AgentSpec, ConfigError, EngineConfig};
pub use consensus::{
    AgentRegistry, ConsensusDecision, ConsensusOrchestrator, ConsensusRecord, QuorumPolicy,
    VoteRecord,
};
pub use context::{
    AccessRequest, ComponentOutcome, ContextClaim, ContextComponent, ContextVerifier,
    VerificationReport,
};
pub use hasher::{Hash, HashAlgorithm, Hasher};
pub use keystore::{KeyStore, SoftwareKeyStore};
pub use merkle::{InclusionProof, MerkleError, MerkleTree, ProofElement};
pub use pipeline::{Decision, DecisionOutcome, DecisionPipeline, EngineError};
pub use proof::{
    CircuitDescriptor, PrivateInputs, ProofArtifact, ProofBackend, ProofError,
    ProofOrchestrator,
};
pub use rules::{Action, ActionKind, Condition, Operator, Rule, RuleEngine, RuleOutcome, RuleSet};
pub use schnorr::SchnorrBackend;
pub use trust::{
    HistoryRecord, HistoryStore, MemoryHistoryStore, TrustLevel, TrustScore, TrustScorer,
    TrustThresholds, TrustWeights,
};

/// Version of the Aegis engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
