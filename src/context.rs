//! Context claims and their verification.
//!
//! Each request declares which context components it backs with claims
//! (device fingerprint, timestamp, location, access pattern). The
//! verifier drives the proof orchestrator per component, in parallel,
//! and folds the outcomes into a `VerificationReport`. A component that
//! fails to prove is recorded as unverified data; it never aborts the
//! rest of the request.

use crate::canonical;
use crate::hasher::{Hash, Hasher};
use crate::proof::{PrivateInputs, ProofArtifact, ProofOrchestrator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Verifiable context components
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContextComponent {
    DeviceFingerprint,
    Timestamp,
    Location,
    AccessPattern,
}

impl ContextComponent {
    pub const ALL: [ContextComponent; 4] = [
        ContextComponent::DeviceFingerprint,
        ContextComponent::Timestamp,
        ContextComponent::Location,
        ContextComponent::AccessPattern,
    ];

    /// Circuit backing this component
    pub fn circuit_id(&self) -> &'static str {
        match self {
            ContextComponent::DeviceFingerprint => "device_proof",
            ContextComponent::Timestamp => "timestamp_verifier",
            ContextComponent::Location => "location_chain",
            ContextComponent::AccessPattern => "pattern_match",
        }
    }
}

impl std::fmt::Display for ContextComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContextComponent::DeviceFingerprint => "device_fingerprint",
            ContextComponent::Timestamp => "timestamp",
            ContextComponent::Location => "location",
            ContextComponent::AccessPattern => "access_pattern",
        };
        write!(f, "{name}")
    }
}

/// A claim about one context component.
///
/// The inputs stay private: they cross into the proving backend and out
/// comes only an artifact plus the blinded claim digest.
#[derive(Debug, Clone)]
pub struct ContextClaim {
    pub component: ContextComponent,
    pub inputs: BTreeMap<String, Value>,
    pub nonce: [u8; 32],
}

impl ContextClaim {
    pub fn new(component: ContextComponent, inputs: BTreeMap<String, Value>) -> Self {
        let mut nonce = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);
        ContextClaim {
            component,
            inputs,
            nonce,
        }
    }

    /// Private circuit inputs, including the blinding nonce.
    pub fn private_inputs(&self) -> PrivateInputs {
        let mut private = PrivateInputs::new();
        for (key, value) in &self.inputs {
            private.insert(key.clone(), value);
        }
        private.insert("nonce", &Value::String(hex::encode(self.nonce)));
        private
    }

    /// Non-sensitive digest of the claim. The nonce blinds the inputs,
    /// so the digest is safe to expose and persist.
    pub fn digest(&self, hasher: &Hasher) -> Hash {
        let mut payload = canonical::canonical_json_bytes(&Value::Object(
            self.inputs.clone().into_iter().collect(),
        ));
        payload.extend_from_slice(&self.nonce);
        payload.extend_from_slice(self.component.circuit_id().as_bytes());
        hasher.digest(&payload)
    }
}

/// An access request entering the decision pipeline
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub request_id: String,
    pub principal: String,
    pub resource: String,
    pub action: String,
    pub required_components: Vec<ContextComponent>,
    pub claims: BTreeMap<ContextComponent, ContextClaim>,
    pub context_data: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
}

impl AccessRequest {
    pub fn new(
        principal: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        AccessRequest {
            request_id: format!("req-{}", Uuid::new_v4()),
            principal: principal.into(),
            resource: resource.into(),
            action: action.into(),
            required_components: Vec::new(),
            claims: BTreeMap::new(),
            context_data: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Require a component and attach its claim.
    pub fn with_claim(mut self, claim: ContextClaim) -> Self {
        if !self.required_components.contains(&claim.component) {
            self.required_components.push(claim.component);
        }
        self.claims.insert(claim.component, claim);
        self
    }

    /// Require a component without providing a claim (it will fail
    /// verification and contribute zero confidence).
    pub fn require(mut self, component: ContextComponent) -> Self {
        if !self.required_components.contains(&component) {
            self.required_components.push(component);
        }
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_data.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Outcome of one component's verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentOutcome {
    pub verified: bool,
    pub proof_ref: Option<String>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentOutcome {
    fn failed(error: impl Into<String>) -> Self {
        ComponentOutcome {
            verified: false,
            proof_ref: None,
            confidence: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Aggregated verification result for a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub request_id: String,
    pub per_component: BTreeMap<ContextComponent, ComponentOutcome>,
    pub verified: bool,
    pub aggregate_confidence: f64,
    pub completed_at: DateTime<Utc>,
    /// Artifacts backing the verified components; safe to persist.
    pub artifacts: Vec<ProofArtifact>,
}

impl VerificationReport {
    pub fn digest(&self, hasher: &Hasher) -> Hash {
        let bytes = canonical::canonical_bytes(self).unwrap_or_default();
        hasher.digest(&bytes)
    }
}

/// Drives proof generation and verification per context component.
pub struct ContextVerifier {
    orchestrator: Arc<ProofOrchestrator>,
    confidences: BTreeMap<ContextComponent, f64>,
    hasher: Hasher,
}

impl ContextVerifier {
    pub fn new(
        orchestrator: Arc<ProofOrchestrator>,
        confidences: BTreeMap<ContextComponent, f64>,
        hasher: Hasher,
    ) -> Self {
        let confidences = confidences
            .into_iter()
            .map(|(c, v)| (c, v.clamp(0.0, 1.0)))
            .collect();
        ContextVerifier {
            orchestrator,
            confidences,
            hasher,
        }
    }

    /// Default per-component confidences
    pub fn default_confidences() -> BTreeMap<ContextComponent, f64> {
        BTreeMap::from([
            (ContextComponent::DeviceFingerprint, 0.9),
            (ContextComponent::Timestamp, 0.7),
            (ContextComponent::Location, 0.8),
            (ContextComponent::AccessPattern, 0.6),
        ])
    }

    /// Verify every required component of the request.
    ///
    /// Components run in parallel and are individually deadline-bounded
    /// by the orchestrator; each failure is captured as data.
    pub fn verify(&self, request: &AccessRequest) -> VerificationReport {
        let outcomes: Vec<(ContextComponent, ComponentOutcome, Option<ProofArtifact>)> =
            std::thread::scope(|s| {
                let handles: Vec<_> = request
                    .required_components
                    .iter()
                    .map(|&component| {
                        (
                            component,
                            s.spawn(move || self.verify_component(request, component)),
                        )
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|(component, handle)| match handle.join() {
                        Ok((outcome, artifact)) => (component, outcome, artifact),
                        Err(_) => (
                            component,
                            ComponentOutcome::failed("component worker panicked"),
                            None,
                        ),
                    })
                    .collect()
            });

        let mut per_component = BTreeMap::new();
        let mut artifacts = Vec::new();
        for (component, outcome, artifact) in outcomes {
            per_component.insert(component, outcome);
            if let Some(artifact) = artifact {
                artifacts.push(artifact);
            }
        }

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for component in per_component.keys() {
            let weight = self.confidences.get(component).copied().unwrap_or(0.0);
            denominator += weight;
            if per_component[component].verified {
                numerator += weight;
            }
        }

        // Unverified baseline when nothing was required (or the required
        // set carries no weight at all).
        let aggregate_confidence = if denominator > 0.0 {
            (numerator / denominator).clamp(0.0, 1.0)
        } else {
            0.2
        };

        let verified = per_component.values().all(|o| o.verified);

        info!(
            request_id = %request.request_id,
            verified,
            aggregate_confidence,
            components = per_component.len(),
            "context verification completed"
        );

        VerificationReport {
            request_id: request.request_id.clone(),
            per_component,
            verified,
            aggregate_confidence,
            completed_at: Utc::now(),
            artifacts,
        }
    }

    fn verify_component(
        &self,
        request: &AccessRequest,
        component: ContextComponent,
    ) -> (ComponentOutcome, Option<ProofArtifact>) {
        let Some(claim) = request.claims.get(&component) else {
            return (ComponentOutcome::failed("MissingClaim"), None);
        };

        let claim_digest = hex::encode(claim.digest(&self.hasher));
        let mut public = BTreeMap::new();
        public.insert("claim_digest".to_string(), Value::String(claim_digest));

        let artifact = match self.orchestrator.generate(
            component.circuit_id(),
            claim.private_inputs(),
            public,
        ) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(component = %component, error = %e, "proof generation failed");
                return (ComponentOutcome::failed(e.kind()), None);
            }
        };

        match self.orchestrator.verify(&artifact) {
            Ok(true) => {
                let confidence = self.confidences.get(&component).copied().unwrap_or(0.0);
                let outcome = ComponentOutcome {
                    verified: true,
                    proof_ref: Some(hex::encode(artifact.content_hash(&self.hasher))),
                    confidence,
                    error: None,
                };
                (outcome, Some(artifact))
            }
            Ok(false) => (
                ComponentOutcome::failed("IntegrityFail"),
                Some(artifact),
            ),
            Err(e) => {
                warn!(component = %component, error = %e, "proof verification failed");
                (ComponentOutcome::failed(e.kind()), Some(artifact))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::HashAlgorithm;
    use crate::proof::test_backends::StubBackend;
    use crate::proof::ProofOrchestrator;
    use serde_json::json;
    use std::time::Duration;

    fn hasher() -> Hasher {
        Hasher::new(HashAlgorithm::Sha256)
    }

    fn claim(component: ContextComponent) -> ContextClaim {
        let mut inputs = BTreeMap::new();
        inputs.insert("value".to_string(), json!("sample"));
        ContextClaim::new(component, inputs)
    }

    fn verifier_with(backends: Vec<StubBackend>) -> ContextVerifier {
        let mut orchestrator = ProofOrchestrator::new(Duration::from_millis(500), 4);
        for backend in backends {
            orchestrator
                .register_backend(Arc::new(backend))
                .unwrap();
        }
        ContextVerifier::new(
            Arc::new(orchestrator),
            ContextVerifier::default_confidences(),
            hasher(),
        )
    }

    #[test]
    fn test_all_components_verified() {
        let verifier = verifier_with(vec![StubBackend::new(
            "stub",
            &["device_proof", "timestamp_verifier"],
        )]);
        let request = AccessRequest::new("alice", "/vault/1", "read")
            .with_claim(claim(ContextComponent::DeviceFingerprint))
            .with_claim(claim(ContextComponent::Timestamp));

        let report = verifier.verify(&request);
        assert!(report.verified);
        assert_eq!(report.per_component.len(), 2);
        assert!((report.aggregate_confidence - 1.0).abs() < 1e-9);
        assert_eq!(report.artifacts.len(), 2);
    }

    #[test]
    fn test_no_required_components_gets_floor() {
        let verifier = verifier_with(vec![StubBackend::new("stub", &["device_proof"])]);
        let request = AccessRequest::new("alice", "/vault/1", "read");

        let report = verifier.verify(&request);
        assert!(report.verified);
        assert!((report.aggregate_confidence - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_failed_component_is_data_not_abort() {
        let mut failing = StubBackend::new("failing", &["location_chain"]);
        failing.fail_generation = true;
        let verifier = verifier_with(vec![
            StubBackend::new("stub", &["device_proof"]),
            failing,
        ]);

        let request = AccessRequest::new("alice", "/vault/1", "read")
            .with_claim(claim(ContextComponent::DeviceFingerprint))
            .with_claim(claim(ContextComponent::Location));

        let report = verifier.verify(&request);
        assert!(!report.verified);

        let device = &report.per_component[&ContextComponent::DeviceFingerprint];
        assert!(device.verified);
        let location = &report.per_component[&ContextComponent::Location];
        assert!(!location.verified);
        assert_eq!(location.error.as_deref(), Some("BackendError"));

        // (0.9 * 1) / (0.9 + 0.8)
        let expected = 0.9 / (0.9 + 0.8);
        assert!((report.aggregate_confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_component_timeout_recorded() {
        let mut slow = StubBackend::new("slow", &["location_chain"]);
        slow.delay = Some(Duration::from_millis(200));

        let mut orchestrator = ProofOrchestrator::new(Duration::from_millis(500), 4);
        orchestrator
            .register_backend(Arc::new(StubBackend::new("stub", &["device_proof"])))
            .unwrap();
        orchestrator.register_backend(Arc::new(slow)).unwrap();
        orchestrator.set_circuit_timeout("location_chain", Duration::from_millis(30));

        let verifier = ContextVerifier::new(
            Arc::new(orchestrator),
            ContextVerifier::default_confidences(),
            hasher(),
        );

        let request = AccessRequest::new("bob", "/vault/2", "write")
            .with_claim(claim(ContextComponent::DeviceFingerprint))
            .with_claim(claim(ContextComponent::Location));

        let report = verifier.verify(&request);
        let location = &report.per_component[&ContextComponent::Location];
        assert!(!location.verified);
        assert_eq!(location.error.as_deref(), Some("Timeout"));

        let expected = 0.9 / (0.9 + 0.8);
        assert!((report.aggregate_confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_missing_claim_contributes_zero() {
        let verifier = verifier_with(vec![StubBackend::new("stub", &["device_proof"])]);
        let request = AccessRequest::new("alice", "/vault/1", "read")
            .with_claim(claim(ContextComponent::DeviceFingerprint))
            .require(ContextComponent::AccessPattern);

        let report = verifier.verify(&request);
        assert!(!report.verified);
        let pattern = &report.per_component[&ContextComponent::AccessPattern];
        assert_eq!(pattern.error.as_deref(), Some("MissingClaim"));

        let expected = 0.9 / (0.9 + 0.6);
        assert!((report.aggregate_confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_report_digest_changes_with_content() {
        let verifier = verifier_with(vec![StubBackend::new("stub", &["device_proof"])]);
        let request = AccessRequest::new("alice", "/vault/1", "read")
            .with_claim(claim(ContextComponent::DeviceFingerprint));

        let a = verifier.verify(&request);
        let mut b = a.clone();
        b.aggregate_confidence = 0.0;
        assert_ne!(a.digest(&hasher()), b.digest(&hasher()));
    }

    #[test]
    fn test_claim_digest_blinded_by_nonce() {
        let mut inputs = BTreeMap::new();
        inputs.insert("fp".to_string(), json!("same"));
        let a = ContextClaim::new(ContextComponent::DeviceFingerprint, inputs.clone());
        let b = ContextClaim::new(ContextComponent::DeviceFingerprint, inputs);
        assert_ne!(a.digest(&hasher()), b.digest(&hasher()));
    }
}
