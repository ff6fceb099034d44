//! Append-only Merkle audit log.
//!
//! Entries are canonically encoded, framed as `u64` little-endian length
//! plus bytes in an append-only file, and hashed into a Merkle tree whose
//! root is the log's tamper-evidence anchor. A sidecar `<log>.root` file
//! carries the last published root; it is advisory only. On startup the
//! root recomputed from the persisted entries is authoritative, and any
//! disagreement with the sidecar refuses the log for writing.

use crate::canonical;
use crate::hasher::{hashes_equal, Hash, Hasher};
use crate::keystore::{verify_detached, KeyStore, KeyStoreError};
use crate::merkle::{InclusionProof, MerkleError, MerkleTree};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit integrity failure: recomputed root {recomputed}, stored root {stored}")]
    IntegrityFail { recomputed: String, stored: String },

    #[error("malformed audit data: {0}")]
    Malformed(String),

    #[error("sequence {seq} out of range for {len} entries")]
    OutOfRange { seq: u64, len: u64 },

    #[error("append timed out after {waited_ms}ms waiting for the writer lock")]
    Timeout { waited_ms: u64 },

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error("crypto error: {0}")]
    Crypto(#[from] KeyStoreError),
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Content hashes of the per-stage evidence recorded with a decision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRefs {
    pub verification_report: String,
    pub rule_outcome: String,
    pub consensus_record: String,
}

/// A single entry of the audit log
///
/// Once appended, the canonical bytes of an entry are immutable;
/// `sequence_no` is strictly monotonic starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_no: u64,
    pub timestamp_ns: u64,
    pub event: String,
    pub actor: String,
    pub resource: String,
    pub action: String,
    pub decision: String,
    pub evidence_refs: EvidenceRefs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    /// Canonical bytes: sorted keys, compact, UTF-8. These exact bytes
    /// are what the Merkle tree commits to.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(canonical::canonical_bytes(self)?)
    }
}

/// Caller-supplied fields of an entry; the log assigns sequence number
/// and timestamp at append time.
#[derive(Debug, Clone, Default)]
pub struct EntryFields {
    pub event: String,
    pub actor: String,
    pub resource: String,
    pub action: String,
    pub decision: String,
    pub evidence_refs: EvidenceRefs,
    pub rule_id: Option<String>,
    pub error: Option<String>,
}

impl EntryFields {
    pub fn new(event: impl Into<String>) -> Self {
        EntryFields {
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = decision.into();
        self
    }

    pub fn with_evidence(mut self, evidence: EvidenceRefs) -> Self {
        self.evidence_refs = evidence;
        self
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Tamper-evident receipt returned for every successful append
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub audit_sequence_no: u64,
    pub audit_root_after: String,
    pub consensus_record_hash: String,
    pub verification_report_hash: String,
    pub rule_outcome_hash: String,
}

/// Immutable view of the log taken under the lock
#[derive(Debug, Clone)]
pub struct AuditSnapshot {
    pub root: Hash,
    pub leaves: Vec<Vec<u8>>,
}

impl AuditSnapshot {
    pub fn entry_count(&self) -> u64 {
        self.leaves.len() as u64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RootSidecar {
    algorithm: String,
    entry_count: u64,
    root_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signer_pubkey: Option<String>,
}

struct LogState {
    leaves: Vec<Vec<u8>>,
    tree: MerkleTree,
    file: File,
}

/// Append-only persistent audit log with Merkle integrity proofs
///
/// At most one writer at a time; readers either take the shared lock or
/// copy a snapshot. Root and leaves are always published together.
pub struct AuditLog {
    path: PathBuf,
    root_path: PathBuf,
    hasher: Hasher,
    keystore: Option<Arc<dyn KeyStore>>,
    append_timeout: Option<Duration>,
    state: RwLock<LogState>,
}

impl AuditLog {
    /// Open (or create) the log at `path`, reconstructing the root from
    /// the persisted entries.
    pub fn open(path: impl AsRef<Path>, hasher: Hasher) -> Result<Self> {
        Self::open_inner(path.as_ref(), hasher, None, None)
    }

    /// Open with a keystore; the sidecar root is then signed on every
    /// checkpoint.
    pub fn with_keystore(
        path: impl AsRef<Path>,
        hasher: Hasher,
        keystore: Arc<dyn KeyStore>,
    ) -> Result<Self> {
        Self::open_inner(path.as_ref(), hasher, Some(keystore), None)
    }

    /// Bound the wait for the writer lock on append.
    pub fn with_append_timeout(mut self, timeout: Duration) -> Self {
        self.append_timeout = Some(timeout);
        self
    }

    fn open_inner(
        path: &Path,
        hasher: Hasher,
        keystore: Option<Arc<dyn KeyStore>>,
        append_timeout: Option<Duration>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let leaves = if path.exists() {
            read_records(path)?
        } else {
            Vec::new()
        };

        for (i, bytes) in leaves.iter().enumerate() {
            let entry: AuditEntry = serde_json::from_slice(bytes)
                .map_err(|e| AuditError::Malformed(format!("entry {i} unparseable: {e}")))?;
            if entry.sequence_no != i as u64 {
                return Err(AuditError::Malformed(format!(
                    "entry {i} carries sequence_no {}",
                    entry.sequence_no
                )));
            }
        }

        let tree = MerkleTree::build(hasher, &leaves);
        let root = tree.root();
        let root_path = sidecar_path(path);

        if root_path.exists() {
            let sidecar: RootSidecar = serde_json::from_slice(&fs::read(&root_path)?)?;
            if sidecar.algorithm != hasher.algorithm().to_string() {
                return Err(AuditError::Malformed(format!(
                    "sidecar algorithm {} does not match configured {}",
                    sidecar.algorithm,
                    hasher.algorithm()
                )));
            }
            if sidecar.root_hex != hex::encode(root) || sidecar.entry_count != leaves.len() as u64
            {
                error!(
                    recomputed = %hex::encode(root),
                    stored = %sidecar.root_hex,
                    "audit log root mismatch on startup, refusing writes"
                );
                return Err(AuditError::IntegrityFail {
                    recomputed: hex::encode(root),
                    stored: sidecar.root_hex,
                });
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let log = AuditLog {
            path: path.to_path_buf(),
            root_path,
            hasher,
            keystore,
            append_timeout,
            state: RwLock::new(LogState { leaves, tree, file }),
        };

        log.write_sidecar(&root, log.entry_count())?;
        Ok(log)
    }

    /// Append an entry and return the receipt carrying the new root.
    ///
    /// The record is persisted before any in-memory state changes, so a
    /// failed write leaves the log untouched. The sidecar write is
    /// advisory; recomputation wins on startup.
    pub fn append(&self, fields: EntryFields) -> Result<DecisionReceipt> {
        let mut state = match self.append_timeout {
            Some(timeout) => self.state.try_write_for(timeout).ok_or(AuditError::Timeout {
                waited_ms: timeout.as_millis() as u64,
            })?,
            None => self.state.write(),
        };

        let sequence_no = state.leaves.len() as u64;
        let entry = AuditEntry {
            sequence_no,
            timestamp_ns: now_ns(),
            event: fields.event,
            actor: fields.actor,
            resource: fields.resource,
            action: fields.action,
            decision: fields.decision,
            evidence_refs: fields.evidence_refs,
            rule_id: fields.rule_id,
            error: fields.error,
        };
        let bytes = entry.canonical_bytes()?;

        let mut framed = Vec::with_capacity(8 + bytes.len());
        framed.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        framed.extend_from_slice(&bytes);
        state.file.write_all(&framed)?;
        state.file.sync_data()?;

        state.leaves.push(bytes);
        let tree = MerkleTree::build(self.hasher, &state.leaves);
        state.tree = tree;
        let root = state.tree.root();
        let count = state.leaves.len() as u64;
        drop(state);

        if let Err(e) = self.write_sidecar(&root, count) {
            warn!(error = %e, "sidecar checkpoint write failed");
        }

        info!(sequence_no, root = %hex::encode(root), event = %entry.event, "audit entry appended");

        Ok(DecisionReceipt {
            audit_sequence_no: sequence_no,
            audit_root_after: hex::encode(root),
            consensus_record_hash: entry.evidence_refs.consensus_record,
            verification_report_hash: entry.evidence_refs.verification_report,
            rule_outcome_hash: entry.evidence_refs.rule_outcome,
        })
    }

    pub fn current_root(&self) -> Hash {
        self.state.read().tree.root()
    }

    pub fn entry_count(&self) -> u64 {
        self.state.read().leaves.len() as u64
    }

    /// Inclusion proof for the entry at `seq`
    pub fn inclusion_proof(&self, seq: u64) -> Result<InclusionProof> {
        let state = self.state.read();
        let len = state.leaves.len() as u64;
        if seq >= len {
            return Err(AuditError::OutOfRange { seq, len });
        }
        Ok(state.tree.inclusion_proof(seq as usize)?)
    }

    /// Parsed entry at `seq`
    pub fn entry(&self, seq: u64) -> Result<AuditEntry> {
        let state = self.state.read();
        let len = state.leaves.len() as u64;
        let bytes = state
            .leaves
            .get(seq as usize)
            .ok_or(AuditError::OutOfRange { seq, len })?;
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Verify the entry at `seq` against the stored root, regenerating
    /// the proof when none is supplied.
    pub fn verify_entry(&self, seq: u64, proof: Option<&InclusionProof>) -> Result<bool> {
        let state = self.state.read();
        let len = state.leaves.len() as u64;
        let bytes = state
            .leaves
            .get(seq as usize)
            .ok_or(AuditError::OutOfRange { seq, len })?;

        let generated;
        let proof = match proof {
            Some(p) => p,
            None => {
                generated = state.tree.inclusion_proof(seq as usize)?;
                &generated
            }
        };

        Ok(MerkleTree::verify_inclusion(
            &self.hasher,
            bytes,
            seq as usize,
            proof,
            &state.tree.root(),
        ))
    }

    /// Recompute the tree from the persisted file and compare with the
    /// published root. Also checks the sidecar checkpoint signature when
    /// one is present.
    pub fn verify_full_log(&self) -> Result<bool> {
        let state = self.state.read();
        let persisted = read_records(&self.path)?;
        let recomputed = MerkleTree::build(self.hasher, &persisted).root();
        if !hashes_equal(&recomputed, &state.tree.root()) {
            return Ok(false);
        }
        if persisted.len() != state.leaves.len() {
            return Ok(false);
        }
        drop(state);

        if self.root_path.exists() {
            let sidecar: RootSidecar = serde_json::from_slice(&fs::read(&self.root_path)?)?;
            if let (Some(signature), Some(pubkey)) = (&sidecar.signature, &sidecar.signer_pubkey) {
                use base64::Engine as _;
                let sig = base64::engine::general_purpose::STANDARD
                    .decode(signature)
                    .map_err(|e| AuditError::Malformed(format!("sidecar signature: {e}")))?;
                let pk = hex::decode(pubkey)
                    .map_err(|e| AuditError::Malformed(format!("sidecar pubkey: {e}")))?;
                let payload = checkpoint_payload(&recomputed, sidecar.entry_count);
                if verify_detached(&pk, &payload, &sig).is_err() {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Lazily parsed entries in `[from, to)`, clamped to the log range.
    pub fn iterate_entries(
        &self,
        from: u64,
        to: u64,
    ) -> impl Iterator<Item = Result<AuditEntry>> {
        let state = self.state.read();
        let len = state.leaves.len() as u64;
        let from = from.min(len) as usize;
        let to = to.min(len).max(from as u64) as usize;
        let slice: Vec<Vec<u8>> = state.leaves[from..to].to_vec();
        drop(state);

        slice
            .into_iter()
            .map(|bytes| serde_json::from_slice(&bytes).map_err(AuditError::from))
    }

    /// Copy of the leaves and root taken atomically under the lock
    pub fn snapshot(&self) -> AuditSnapshot {
        let state = self.state.read();
        AuditSnapshot {
            root: state.tree.root(),
            leaves: state.leaves.clone(),
        }
    }

    pub fn algorithm_name(&self) -> String {
        self.hasher.algorithm().to_string()
    }

    fn write_sidecar(&self, root: &Hash, entry_count: u64) -> Result<()> {
        let (signature, signer_pubkey) = match &self.keystore {
            Some(ks) => {
                use base64::Engine as _;
                let payload = checkpoint_payload(root, entry_count);
                let sig = ks.sign(&payload)?;
                (
                    Some(base64::engine::general_purpose::STANDARD.encode(sig)),
                    Some(hex::encode(ks.public_key_bytes())),
                )
            }
            None => (None, None),
        };

        let sidecar = RootSidecar {
            algorithm: self.hasher.algorithm().to_string(),
            entry_count,
            root_hex: hex::encode(root),
            signature,
            signer_pubkey,
        };

        let mut tmp = self.root_path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec(&sidecar)?)?;
        fs::rename(&tmp, &self.root_path)?;
        Ok(())
    }
}

fn now_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".root");
    PathBuf::from(s)
}

fn checkpoint_payload(root: &Hash, entry_count: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(40);
    payload.extend_from_slice(root);
    payload.extend_from_slice(&entry_count.to_le_bytes());
    payload
}

fn read_records(path: &Path) -> Result<Vec<Vec<u8>>> {
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() - offset < 8 {
            return Err(AuditError::Malformed("truncated length prefix".into()));
        }
        let len = u64::from_le_bytes(data[offset..offset + 8].try_into().expect("8 bytes"))
            as usize;
        offset += 8;
        if data.len() - offset < len {
            return Err(AuditError::Malformed("truncated record body".into()));
        }
        records.push(data[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(records)
}
