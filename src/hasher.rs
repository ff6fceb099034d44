use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use subtle::ConstantTimeEq;

/// Hash width in bytes. One algorithm per deployment, always 32-byte output.
pub const HASH_LEN: usize = 32;

/// 32-byte hash value (SHA-256 or SHA3-256 depending on deployment config)
pub type Hash = [u8; HASH_LEN];

/// Root of an empty tree / empty log
pub const EMPTY_ROOT: Hash = [0u8; HASH_LEN];

/// Domain tag prepended when hashing a leaf
pub const LEAF_TAG: u8 = 0x00;

/// Domain tag prepended when hashing an internal node
pub const NODE_TAG: u8 = 0x01;

/// Hash algorithm for a deployment
///
/// Fixed at startup and recorded in the audit log sidecar; mixing
/// algorithms within one log is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    #[serde(rename = "sha3_256")]
    Sha3_256,
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha3_256 => write!(f, "sha3_256"),
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha3_256" => Ok(HashAlgorithm::Sha3_256),
            other => Err(format!("unknown hash algorithm: {other}")),
        }
    }
}

/// Domain-separated hashing primitive
///
/// Leaf hashing prefixes `0x00`, internal node hashing prefixes `0x01`.
/// The tags keep a leaf from ever colliding with an internal
/// concatenation (second-preimage confusion between tree levels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hasher {
    algorithm: HashAlgorithm,
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Hasher { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Plain digest, no domain tag. Used for content hashes of records
    /// (proof artifacts, consensus records, reports).
    pub fn digest(&self, data: &[u8]) -> Hash {
        match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hasher.finalize().into()
            }
            HashAlgorithm::Sha3_256 => {
                let mut hasher = Sha3_256::new();
                hasher.update(data);
                hasher.finalize().into()
            }
        }
    }

    /// Hash of a leaf: `H(0x00 || bytes)`
    pub fn leaf_hash(&self, data: &[u8]) -> Hash {
        match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update([LEAF_TAG]);
                hasher.update(data);
                hasher.finalize().into()
            }
            HashAlgorithm::Sha3_256 => {
                let mut hasher = Sha3_256::new();
                hasher.update([LEAF_TAG]);
                hasher.update(data);
                hasher.finalize().into()
            }
        }
    }

    /// Hash of an internal node: `H(0x01 || left || right)`
    pub fn node_hash(&self, left: &Hash, right: &Hash) -> Hash {
        match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update([NODE_TAG]);
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            }
            HashAlgorithm::Sha3_256 => {
                let mut hasher = Sha3_256::new();
                hasher.update([NODE_TAG]);
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            }
        }
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Hasher::new(HashAlgorithm::Sha256)
    }
}

/// Constant-time hash comparison for verification paths
pub fn hashes_equal(a: &Hash, b: &Hash) -> bool {
    a.as_slice().ct_eq(b.as_slice()).into()
}

/// Parse a 32-byte hash from hex, rejecting any other length
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    let arr: Hash = bytes.try_into().ok()?;
    Some(arr)
}
