//! Built-in proof backend: Schnorr proof of knowledge over Ristretto.
//!
//! The backend derives a secret scalar from the claim's private inputs,
//! publishes its commitment point, and proves knowledge of the scalar
//! with a Fiat-Shamir transformed Schnorr protocol bound to the circuit
//! id and the public claim digest. The verifier learns that the prover
//! held inputs consistent with the published commitment and nothing
//! else.
//!
//! Proof layout: `R (32 bytes) || z (32 bytes)` with
//! `z = r + c * s`, `c = H(R || P || circuit_id || claim_digest)`.

use crate::proof::{
    CircuitDescriptor, PrivateInputs, ProofArtifact, ProofBackend, ProofError, Result,
};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use zeroize::Zeroize;

pub const BACKEND_ID: &str = "schnorr-ristretto";

/// Circuits served by the built-in backend, one per context component.
pub const CIRCUITS: [&str; 4] = [
    "device_proof",
    "timestamp_verifier",
    "location_chain",
    "pattern_match",
];

const DOMAIN_SECRET: &[u8] = b"aegis.schnorr.secret.v1";
const DOMAIN_CHALLENGE: &[u8] = b"aegis.schnorr.challenge.v1";
const PROOF_LEN: usize = 64;

/// Schnorr proof-of-knowledge backend
#[derive(Debug, Default, Clone, Copy)]
pub struct SchnorrBackend;

impl SchnorrBackend {
    pub fn new() -> Self {
        SchnorrBackend
    }

    /// Secret scalar bound to circuit and private transcript
    fn derive_secret(circuit_id: &str, private_inputs: &PrivateInputs) -> Scalar {
        let mut transcript = private_inputs.transcript_bytes();
        let mut hasher = Sha512::new();
        hasher.update(DOMAIN_SECRET);
        hasher.update((circuit_id.len() as u64).to_le_bytes());
        hasher.update(circuit_id.as_bytes());
        hasher.update(&transcript);
        let scalar = Scalar::from_hash(hasher);
        transcript.zeroize();
        scalar
    }

    fn challenge(
        circuit_id: &str,
        commitment_r: &[u8; 32],
        commitment_p: &[u8; 32],
        claim_digest: &str,
    ) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(DOMAIN_CHALLENGE);
        hasher.update((circuit_id.len() as u64).to_le_bytes());
        hasher.update(circuit_id.as_bytes());
        hasher.update(commitment_r);
        hasher.update(commitment_p);
        hasher.update(claim_digest.as_bytes());
        Scalar::from_hash(hasher)
    }

    fn random_scalar() -> Scalar {
        let mut wide = [0u8; 64];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut wide);
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        wide.zeroize();
        scalar
    }

    fn claim_digest_of(public_inputs: &BTreeMap<String, Value>) -> Result<String> {
        public_inputs
            .get("claim_digest")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ProofError::BadInputs("public inputs missing claim_digest".into()))
    }
}

impl ProofBackend for SchnorrBackend {
    fn backend_id(&self) -> &str {
        BACKEND_ID
    }

    fn declared_circuits(&self) -> Vec<CircuitDescriptor> {
        CIRCUITS
            .iter()
            .map(|c| CircuitDescriptor {
                circuit_id: c.to_string(),
                public_input_keys: vec!["claim_digest".to_string(), "commitment".to_string()],
            })
            .collect()
    }

    fn generate(
        &self,
        circuit_id: &str,
        private_inputs: &PrivateInputs,
        public_inputs: &BTreeMap<String, Value>,
    ) -> Result<ProofArtifact> {
        if !CIRCUITS.contains(&circuit_id) {
            return Err(ProofError::UnknownCircuit(circuit_id.to_string()));
        }
        let claim_digest = Self::claim_digest_of(public_inputs)?;

        let secret = Self::derive_secret(circuit_id, private_inputs);
        let commitment = RistrettoPoint::mul_base(&secret);
        let commitment_bytes = commitment.compress().to_bytes();

        let r = Self::random_scalar();
        let r_point = RistrettoPoint::mul_base(&r).compress().to_bytes();

        let c = Self::challenge(circuit_id, &r_point, &commitment_bytes, &claim_digest);
        let z = r + c * secret;

        let mut proof_bytes = Vec::with_capacity(PROOF_LEN);
        proof_bytes.extend_from_slice(&r_point);
        proof_bytes.extend_from_slice(z.as_bytes());

        let mut outputs = BTreeMap::new();
        outputs.insert("claim_digest".to_string(), Value::String(claim_digest));
        outputs.insert(
            "commitment".to_string(),
            Value::String(hex::encode(commitment_bytes)),
        );

        Ok(ProofArtifact {
            backend_id: BACKEND_ID.to_string(),
            circuit_id: circuit_id.to_string(),
            proof_bytes,
            public_inputs: outputs,
            verification_key_ref: format!("{BACKEND_ID}/{circuit_id}"),
            generated_at: chrono::Utc::now(),
        })
    }

    fn verify(&self, artifact: &ProofArtifact) -> Result<bool> {
        if !CIRCUITS.contains(&artifact.circuit_id.as_str()) {
            return Err(ProofError::UnknownCircuit(artifact.circuit_id.clone()));
        }
        if artifact.proof_bytes.len() != PROOF_LEN {
            return Ok(false);
        }

        let claim_digest = Self::claim_digest_of(&artifact.public_inputs)?;
        let Some(commitment_hex) = artifact
            .public_inputs
            .get("commitment")
            .and_then(Value::as_str)
        else {
            return Err(ProofError::BadInputs(
                "public inputs missing commitment".into(),
            ));
        };

        let Ok(commitment_raw) = hex::decode(commitment_hex) else {
            return Ok(false);
        };
        let Ok(commitment_bytes) = <[u8; 32]>::try_from(commitment_raw.as_slice()) else {
            return Ok(false);
        };
        let Some(commitment) = CompressedRistretto(commitment_bytes).decompress() else {
            return Ok(false);
        };

        let r_bytes: [u8; 32] = artifact.proof_bytes[..32]
            .try_into()
            .expect("slice length checked");
        let z_bytes: [u8; 32] = artifact.proof_bytes[32..]
            .try_into()
            .expect("slice length checked");
        let z: Option<Scalar> = Scalar::from_canonical_bytes(z_bytes).into();
        let Some(z) = z else {
            return Ok(false);
        };

        let c = Self::challenge(
            &artifact.circuit_id,
            &r_bytes,
            &commitment_bytes,
            &claim_digest,
        );

        // z*B - c*P must reproduce the announced nonce point R.
        let recovered =
            RistrettoPoint::vartime_double_scalar_mul_basepoint(&-c, &commitment, &z);
        Ok(recovered.compress().to_bytes() == r_bytes)
    }
}
