//! Proof orchestration.
//!
//! A `ProofBackend` owns the actual proving arithmetic; the orchestrator
//! routes circuits to backends, leases bounded prover sessions, enforces
//! per-circuit deadlines, and exposes single and batch verification.
//! Private inputs never leave the generation boundary: only the
//! resulting artifact and claim digests are safe to persist.

use crate::canonical;
use crate::hasher::{Hash, Hasher};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("proof operation for circuit {circuit} timed out after {elapsed_ms}ms")]
    Timeout { circuit: String, elapsed_ms: u64 },

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("all prover sessions busy")]
    BackendBusy,

    #[error("bad inputs: {0}")]
    BadInputs(String),

    #[error("no backend declared for circuit {0}")]
    UnknownCircuit(String),
}

impl ProofError {
    /// Short kind tag recorded as failure data in verification reports
    pub fn kind(&self) -> &'static str {
        match self {
            ProofError::Timeout { .. } => "Timeout",
            ProofError::BackendError(_) => "BackendError",
            ProofError::BackendBusy => "BackendBusy",
            ProofError::BadInputs(_) => "BadInputs",
            ProofError::UnknownCircuit(_) => "UnknownCircuit",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProofError>;

/// Opaque proof object safe to persist alongside audit entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofArtifact {
    pub backend_id: String,
    pub circuit_id: String,
    #[serde(with = "base64_bytes")]
    pub proof_bytes: Vec<u8>,
    pub public_inputs: BTreeMap<String, serde_json::Value>,
    pub verification_key_ref: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl ProofArtifact {
    /// Content hash pinning this artifact for audit references
    pub fn content_hash(&self, hasher: &Hasher) -> Hash {
        let bytes = canonical::canonical_bytes(self).unwrap_or_default();
        hasher.digest(&bytes)
    }
}

/// Private circuit inputs, zeroed on drop and never serialized.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct PrivateInputs {
    entries: Vec<PrivateEntry>,
}

#[derive(Clone, Zeroize)]
struct PrivateEntry {
    key: String,
    value: String,
}

impl PrivateInputs {
    pub fn new() -> Self {
        PrivateInputs {
            entries: Vec::new(),
        }
    }

    /// Record a named input; the value is stored in canonical JSON form.
    pub fn insert(&mut self, key: impl Into<String>, value: &serde_json::Value) {
        let bytes = canonical::canonical_json_bytes(value);
        self.entries.push(PrivateEntry {
            key: key.into(),
            value: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic transcript of the inputs, consumed only inside a
    /// proving backend. Length-prefixed so adjacent fields cannot be
    /// reassociated.
    pub fn transcript_bytes(&self) -> Vec<u8> {
        let mut sorted: Vec<&PrivateEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));

        let mut out = Vec::new();
        for entry in sorted {
            out.extend_from_slice(&(entry.key.len() as u64).to_le_bytes());
            out.extend_from_slice(entry.key.as_bytes());
            out.extend_from_slice(&(entry.value.len() as u64).to_le_bytes());
            out.extend_from_slice(entry.value.as_bytes());
        }
        out
    }
}

impl Default for PrivateInputs {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape of a circuit declared by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitDescriptor {
    pub circuit_id: String,
    /// Exact key set the artifact's public inputs must carry
    pub public_input_keys: Vec<String>,
}

/// Capability set of a proving backend
pub trait ProofBackend: Send + Sync {
    fn backend_id(&self) -> &str;

    fn declared_circuits(&self) -> Vec<CircuitDescriptor>;

    fn generate(
        &self,
        circuit_id: &str,
        private_inputs: &PrivateInputs,
        public_inputs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ProofArtifact>;

    fn verify(&self, artifact: &ProofArtifact) -> Result<bool>;

    /// Verify several artifacts; results come back in input order and a
    /// failure of one artifact never suppresses the others. Backends
    /// without a native batching primitive fall back to sequential
    /// verification.
    fn batch_verify(&self, artifacts: &[ProofArtifact]) -> Vec<Result<bool>> {
        artifacts.iter().map(|a| self.verify(a)).collect()
    }
}

#[derive(Debug, Default)]
struct ProofStats {
    generated: AtomicU64,
    generation_failures: AtomicU64,
    verified: AtomicU64,
    verification_failures: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStatsSnapshot {
    pub generated: u64,
    pub generation_failures: u64,
    pub verified: u64,
    pub verification_failures: u64,
    pub timeouts: u64,
}

struct PoolInner {
    in_use: Mutex<usize>,
    available: Condvar,
    capacity: usize,
}

/// Bounded pool of prover sessions. Exhaustion blocks the caller up to
/// its deadline, then surfaces `BackendBusy`.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

pub struct SessionLease {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        SessionPool {
            inner: Arc::new(PoolInner {
                in_use: Mutex::new(0),
                available: Condvar::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn acquire(&self, timeout: Duration) -> Result<SessionLease> {
        let deadline = Instant::now() + timeout;
        let mut in_use = self.inner.in_use.lock();
        while *in_use >= self.inner.capacity {
            if self
                .inner
                .available
                .wait_until(&mut in_use, deadline)
                .timed_out()
            {
                return Err(ProofError::BackendBusy);
            }
        }
        *in_use += 1;
        Ok(SessionLease {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut in_use = self.inner.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        self.inner.available.notify_one();
    }
}

/// Routes circuits to backends and bounds every proving call.
pub struct ProofOrchestrator {
    backends: BTreeMap<String, Arc<dyn ProofBackend>>,
    routes: BTreeMap<String, String>,
    shapes: BTreeMap<String, CircuitDescriptor>,
    timeouts: BTreeMap<String, Duration>,
    default_timeout: Duration,
    pool: SessionPool,
    stats: ProofStats,
}

impl ProofOrchestrator {
    pub fn new(default_timeout: Duration, session_capacity: usize) -> Self {
        ProofOrchestrator {
            backends: BTreeMap::new(),
            routes: BTreeMap::new(),
            shapes: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            default_timeout,
            pool: SessionPool::new(session_capacity),
            stats: ProofStats::default(),
        }
    }

    /// Register a backend and route every circuit it declares to it.
    /// When several backends declare the same circuit the first
    /// registration keeps the route (and the declared shape);
    /// `set_route` switches it explicitly.
    pub fn register_backend(&mut self, backend: Arc<dyn ProofBackend>) -> Result<()> {
        let id = backend.backend_id().to_string();
        for circuit in backend.declared_circuits() {
            if !self.routes.contains_key(&circuit.circuit_id) {
                self.routes.insert(circuit.circuit_id.clone(), id.clone());
                self.shapes.insert(circuit.circuit_id.clone(), circuit);
            }
        }
        self.backends.insert(id, backend);
        Ok(())
    }

    /// Override the `circuit -> backend` route (startup configuration).
    pub fn set_route(&mut self, circuit_id: &str, backend_id: &str) -> Result<()> {
        if !self.backends.contains_key(backend_id) {
            return Err(ProofError::BadInputs(format!(
                "unknown backend {backend_id}"
            )));
        }
        if !self.shapes.contains_key(circuit_id) {
            return Err(ProofError::UnknownCircuit(circuit_id.to_string()));
        }
        self.routes
            .insert(circuit_id.to_string(), backend_id.to_string());
        Ok(())
    }

    /// Per-circuit generation/verification deadline
    pub fn set_circuit_timeout(&mut self, circuit_id: &str, timeout: Duration) {
        self.timeouts.insert(circuit_id.to_string(), timeout);
    }

    pub fn declared_circuits(&self) -> Vec<CircuitDescriptor> {
        self.shapes.values().cloned().collect()
    }

    fn backend_for(&self, circuit_id: &str) -> Result<Arc<dyn ProofBackend>> {
        let backend_id = self
            .routes
            .get(circuit_id)
            .ok_or_else(|| ProofError::UnknownCircuit(circuit_id.to_string()))?;
        self.backends
            .get(backend_id)
            .cloned()
            .ok_or_else(|| ProofError::BackendError(format!("backend {backend_id} vanished")))
    }

    fn timeout_for(&self, circuit_id: &str) -> Duration {
        self.timeouts
            .get(circuit_id)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Run a backend call on a worker thread, bounded by the circuit
    /// deadline. The session lease travels with the worker so a slow
    /// backend keeps its session occupied until it actually finishes.
    fn call_bounded<T: Send + 'static>(
        &self,
        circuit_id: &str,
        f: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let timeout = self.timeout_for(circuit_id);
        let lease = self.pool.acquire(timeout)?;

        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        std::thread::Builder::new()
            .name(format!("prover-{circuit_id}"))
            .spawn(move || {
                let _lease = lease;
                let _ = tx.send(f());
            })
            .map_err(|e| ProofError::BackendError(format!("worker spawn failed: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(ProofError::Timeout {
                    circuit: circuit_id.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Generate a proof for `circuit_id`.
    pub fn generate(
        &self,
        circuit_id: &str,
        private_inputs: PrivateInputs,
        public_inputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<ProofArtifact> {
        if private_inputs.is_empty() {
            return Err(ProofError::BadInputs("empty private inputs".into()));
        }
        let backend = self.backend_for(circuit_id)?;
        let circuit = circuit_id.to_string();

        let result = self.call_bounded(circuit_id, move || {
            backend.generate(&circuit, &private_inputs, &public_inputs)
        });

        match &result {
            Ok(artifact) => {
                self.stats.generated.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %artifact.circuit_id, backend = %artifact.backend_id, "proof generated");
            }
            Err(e) => {
                self.stats.generation_failures.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %circuit_id, error = %e, "proof generation failed");
            }
        }
        result
    }

    /// Verify an artifact after checking its public inputs against the
    /// declared circuit shape.
    pub fn verify(&self, artifact: &ProofArtifact) -> Result<bool> {
        self.check_shape(artifact)?;
        let backend = self.backend_for(&artifact.circuit_id)?;
        let owned = artifact.clone();

        let result = self.call_bounded(&artifact.circuit_id, move || backend.verify(&owned));
        match &result {
            Ok(true) => {
                self.stats.verified.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) | Err(_) => {
                self.stats
                    .verification_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Verify a batch, preserving input order.
    ///
    /// Artifacts are grouped per backend to exploit backend batching;
    /// an artifact that fails shape validation or whose verification
    /// errors reports `false` without affecting the others.
    pub fn batch_verify(&self, artifacts: &[ProofArtifact]) -> Vec<bool> {
        let mut results = vec![false; artifacts.len()];
        let mut per_backend: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (i, artifact) in artifacts.iter().enumerate() {
            if self.check_shape(artifact).is_err() {
                self.stats
                    .verification_failures
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.routes.get(&artifact.circuit_id) {
                Some(backend_id) => per_backend.entry(backend_id.clone()).or_default().push(i),
                None => {
                    self.stats
                        .verification_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for (backend_id, indices) in per_backend {
            let Some(backend) = self.backends.get(&backend_id).cloned() else {
                continue;
            };
            let group: Vec<ProofArtifact> =
                indices.iter().map(|&i| artifacts[i].clone()).collect();
            let outcomes = backend.batch_verify(&group);
            for (&i, outcome) in indices.iter().zip(outcomes) {
                let ok = matches!(outcome, Ok(true));
                results[i] = ok;
                if ok {
                    self.stats.verified.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats
                        .verification_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        results
    }

    fn check_shape(&self, artifact: &ProofArtifact) -> Result<()> {
        let shape = self
            .shapes
            .get(&artifact.circuit_id)
            .ok_or_else(|| ProofError::UnknownCircuit(artifact.circuit_id.clone()))?;

        let mut expected: Vec<&str> = shape.public_input_keys.iter().map(String::as_str).collect();
        expected.sort_unstable();
        let actual: Vec<&str> = artifact.public_inputs.keys().map(String::as_str).collect();

        if expected != actual {
            return Err(ProofError::BadInputs(format!(
                "public inputs {actual:?} do not match circuit shape {expected:?}"
            )));
        }
        Ok(())
    }

    pub fn stats(&self) -> ProofStatsSnapshot {
        ProofStatsSnapshot {
            generated: self.stats.generated.load(Ordering::Relaxed),
            generation_failures: self.stats.generation_failures.load(Ordering::Relaxed),
            verified: self.stats.verified.load(Ordering::Relaxed),
            verification_failures: self.stats.verification_failures.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod test_backends {
    use super::*;

    /// Backend that deterministically accepts its own artifacts; proofs
    /// are the digest of the private transcript.
    pub struct StubBackend {
        pub id: String,
        pub circuits: Vec<CircuitDescriptor>,
        pub delay: Option<Duration>,
        pub fail_generation: bool,
    }

    impl StubBackend {
        pub fn new(id: &str, circuit_ids: &[&str]) -> Self {
            StubBackend {
                id: id.to_string(),
                circuits: circuit_ids
                    .iter()
                    .map(|c| CircuitDescriptor {
                        circuit_id: c.to_string(),
                        public_input_keys: vec!["claim_digest".to_string()],
                    })
                    .collect(),
                delay: None,
                fail_generation: false,
            }
        }
    }

    impl ProofBackend for StubBackend {
        fn backend_id(&self) -> &str {
            &self.id
        }

        fn declared_circuits(&self) -> Vec<CircuitDescriptor> {
            self.circuits.clone()
        }

        fn generate(
            &self,
            circuit_id: &str,
            private_inputs: &PrivateInputs,
            public_inputs: &BTreeMap<String, serde_json::Value>,
        ) -> Result<ProofArtifact> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail_generation {
                return Err(ProofError::BackendError("stub generation failure".into()));
            }
            Ok(ProofArtifact {
                backend_id: self.id.clone(),
                circuit_id: circuit_id.to_string(),
                proof_bytes: Hasher::default()
                    .digest(&private_inputs.transcript_bytes())
                    .to_vec(),
                public_inputs: public_inputs.clone(),
                verification_key_ref: format!("stub/{circuit_id}"),
                generated_at: chrono::Utc::now(),
            })
        }

        fn verify(&self, artifact: &ProofArtifact) -> Result<bool> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(artifact.proof_bytes.len() == 32)
        }
    }
}
