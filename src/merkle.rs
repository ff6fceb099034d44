//! Merkle tree over ordered leaves with positional inclusion proofs.
//!
//! Level 0 holds the domain-tagged leaf hashes; each level above pairs
//! adjacent nodes, self-pairing the last node when a level has odd
//! length. Proof elements carry an explicit position bit so a verifier
//! never has to guess concatenation order at an odd boundary.

use crate::hasher::{hashes_equal, Hash, Hasher, EMPTY_ROOT, HASH_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("index {index} out of range for {len} leaves")]
    OutOfRange { index: usize, len: usize },

    #[error("malformed proof: {0}")]
    Malformed(String),

    #[error("inclusion proof does not reproduce the root")]
    IntegrityFail,
}

pub type Result<T> = std::result::Result<T, MerkleError>;

/// One step of an inclusion proof
///
/// `sibling_is_right` is true when the sibling hash sits to the right of
/// the running hash at this level, i.e. when the proven node is a left
/// child. The bits taken bottom-up spell out the leaf index in binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofElement {
    #[serde(with = "hash_hex")]
    pub sibling: Hash,
    pub sibling_is_right: bool,
}

/// Sibling chain from a leaf up to the root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub elements: Vec<ProofElement>,
}

impl InclusionProof {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Rebuild a proof from raw `(hash_bytes, is_right)` pairs, rejecting
    /// wrong-width hashes.
    pub fn from_pairs(pairs: &[(Vec<u8>, bool)]) -> Result<Self> {
        let mut elements = Vec::with_capacity(pairs.len());
        for (bytes, is_right) in pairs {
            let sibling: Hash = bytes.as_slice().try_into().map_err(|_| {
                MerkleError::Malformed(format!(
                    "sibling hash must be {HASH_LEN} bytes, got {}",
                    bytes.len()
                ))
            })?;
            elements.push(ProofElement {
                sibling,
                sibling_is_right: *is_right,
            });
        }
        Ok(InclusionProof { elements })
    }
}

/// Merkle tree derived from an ordered leaf sequence
///
/// A pure value: rebuilt whenever the leaf set changes. The full level
/// array is retained so proof extraction is O(log n).
#[derive(Debug, Clone)]
pub struct MerkleTree {
    hasher: Hasher,
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build the tree over the given leaf byte blocks.
    pub fn build<B: AsRef<[u8]>>(hasher: Hasher, blocks: &[B]) -> Self {
        if blocks.is_empty() {
            return MerkleTree {
                hasher,
                levels: Vec::new(),
            };
        }

        let leaf_hashes: Vec<Hash> = blocks.iter().map(|b| hasher.leaf_hash(b.as_ref())).collect();
        let mut levels = vec![leaf_hashes];

        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().expect("non-empty level array");
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for chunk in current.chunks(2) {
                let left = &chunk[0];
                // Odd level: the last node pairs with itself.
                let right = chunk.get(1).unwrap_or(left);
                next.push(hasher.node_hash(left, right));
            }
            levels.push(next);
        }

        MerkleTree { hasher, levels }
    }

    pub fn len(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Current root; the all-zero sentinel when there are no leaves.
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first().copied())
            .unwrap_or(EMPTY_ROOT)
    }

    /// Inclusion proof for the leaf at `index`.
    ///
    /// At each level the sibling is `index ^ 1`; when that slot does not
    /// exist (odd boundary) the node's own hash is recorded with the same
    /// position bit, matching the self-pairing done by `build`.
    pub fn inclusion_proof(&self, index: usize) -> Result<InclusionProof> {
        let len = self.len();
        if index >= len {
            return Err(MerkleError::OutOfRange { index, len });
        }

        let mut elements = Vec::new();
        let mut current = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = current ^ 1;
            let sibling = level.get(sibling_index).copied().unwrap_or(level[current]);
            elements.push(ProofElement {
                sibling,
                sibling_is_right: current & 1 == 0,
            });
            current >>= 1;
        }

        Ok(InclusionProof { elements })
    }

    /// Verify that `leaf_bytes` at `index` is included under `root`.
    ///
    /// Recomputes the tagged leaf hash, folds the sibling chain ordering
    /// each concatenation by the recorded position bit, and checks the
    /// result against `root` in constant time. The position bits must
    /// agree with the binary path of `index`.
    pub fn verify_inclusion(
        hasher: &Hasher,
        leaf_bytes: &[u8],
        index: usize,
        proof: &InclusionProof,
        root: &Hash,
    ) -> bool {
        let mut current = hasher.leaf_hash(leaf_bytes);
        let mut idx = index;

        for element in &proof.elements {
            if element.sibling_is_right != (idx & 1 == 0) {
                return false;
            }
            current = if element.sibling_is_right {
                hasher.node_hash(&current, &element.sibling)
            } else {
                hasher.node_hash(&element.sibling, &current)
            };
            idx >>= 1;
        }

        hashes_equal(&current, root)
    }
}

pub(crate) mod hash_hex {
    use crate::hasher::Hash;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::hasher::hash_from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("expected 32-byte hex hash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::HashAlgorithm;

    fn hasher() -> Hasher {
        Hasher::new(HashAlgorithm::Sha256)
    }

    fn blocks(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("log entry {i}").into_bytes()).collect()
    }

    #[test]
    fn test_empty_tree_root_is_sentinel() {
        let tree = MerkleTree::build(hasher(), &Vec::<Vec<u8>>::new());
        assert_eq!(tree.root(), EMPTY_ROOT);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let data = blocks(1);
        let tree = MerkleTree::build(hasher(), &data);
        assert_eq!(tree.root(), hasher().leaf_hash(&data[0]));

        let proof = tree.inclusion_proof(0).unwrap();
        assert!(proof.is_empty());
        assert!(MerkleTree::verify_inclusion(
            &hasher(),
            &data[0],
            0,
            &proof,
            &tree.root()
        ));
    }

    #[test]
    fn test_all_leaves_verify() {
        for n in 1..=9 {
            let data = blocks(n);
            let tree = MerkleTree::build(hasher(), &data);
            let root = tree.root();
            for (i, block) in data.iter().enumerate() {
                let proof = tree.inclusion_proof(i).unwrap();
                assert!(
                    MerkleTree::verify_inclusion(&hasher(), block, i, &proof, &root),
                    "leaf {i} of {n} failed"
                );
            }
        }
    }

    #[test]
    fn test_proof_length_four_leaves() {
        let data = blocks(4);
        let tree = MerkleTree::build(hasher(), &data);
        assert_eq!(tree.inclusion_proof(1).unwrap().len(), 2);
    }

    #[test]
    fn test_odd_tree_self_pair() {
        let data = blocks(3);
        let tree = MerkleTree::build(hasher(), &data);
        let proof = tree.inclusion_proof(2).unwrap();

        // Level 0 has no sibling for index 2: the proof carries the
        // node's own hash with the left-child position bit.
        assert_eq!(proof.elements[0].sibling, hasher().leaf_hash(&data[2]));
        assert!(proof.elements[0].sibling_is_right);
        assert!(MerkleTree::verify_inclusion(
            &hasher(),
            &data[2],
            2,
            &proof,
            &tree.root()
        ));
    }

    #[test]
    fn test_tampered_leaf_fails() {
        let data = blocks(3);
        let tree = MerkleTree::build(hasher(), &data);
        let proof = tree.inclusion_proof(2).unwrap();

        let mut tampered = data[2].clone();
        tampered[0] ^= 0xFF;
        assert!(!MerkleTree::verify_inclusion(
            &hasher(),
            &tampered,
            2,
            &proof,
            &tree.root()
        ));
    }

    #[test]
    fn test_swapped_position_bit_fails() {
        let data = blocks(4);
        let tree = MerkleTree::build(hasher(), &data);
        let mut proof = tree.inclusion_proof(2).unwrap();
        proof.elements[0].sibling_is_right = !proof.elements[0].sibling_is_right;
        assert!(!MerkleTree::verify_inclusion(
            &hasher(),
            &data[2],
            2,
            &proof,
            &tree.root()
        ));
    }

    #[test]
    fn test_wrong_index_fails() {
        let data = blocks(4);
        let tree = MerkleTree::build(hasher(), &data);
        let proof = tree.inclusion_proof(2).unwrap();
        assert!(!MerkleTree::verify_inclusion(
            &hasher(),
            &data[2],
            3,
            &proof,
            &tree.root()
        ));
    }

    #[test]
    fn test_roots_differ_when_any_leaf_differs() {
        let a = blocks(5);
        let mut b = blocks(5);
        b[3] = b"different".to_vec();
        assert_ne!(
            MerkleTree::build(hasher(), &a).root(),
            MerkleTree::build(hasher(), &b).root()
        );
    }

    #[test]
    fn test_out_of_range_proof() {
        let tree = MerkleTree::build(hasher(), &blocks(2));
        assert!(matches!(
            tree.inclusion_proof(2),
            Err(MerkleError::OutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_from_pairs_rejects_bad_width() {
        let pairs = vec![(vec![0u8; 31], true)];
        assert!(matches!(
            InclusionProof::from_pairs(&pairs),
            Err(MerkleError::Malformed(_))
        ));
    }
}
