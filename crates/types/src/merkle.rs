//! Binary Merkle tree over block parts.
//!
//! The part-set root commits to the ordered sequence of part payloads. Each
//! part ships with a [`MerkleProof`] so parts can be verified independently
//! as they arrive out of order from the network.
//!
//! Leaves are `keccak256(0x00 || payload)`; inner nodes are
//! `keccak256(0x01 || left || right)`. An odd node at the end of a level is
//! promoted unchanged.

use serde::{Deserialize, Serialize};

use crate::H256;

const LEAF_PREFIX: &[u8] = &[0x00];
const INNER_PREFIX: &[u8] = &[0x01];

fn leaf_hash(payload: &[u8]) -> H256 {
    H256::keccak256_concat(&[LEAF_PREFIX, payload])
}

fn inner_hash(left: &H256, right: &H256) -> H256 {
    H256::keccak256_concat(&[INNER_PREFIX, left.as_bytes(), right.as_bytes()])
}

/// Compute the Merkle root of an ordered list of payloads.
///
/// An empty list hashes to [`H256::NIL`].
pub fn merkle_root(payloads: &[&[u8]]) -> H256 {
    if payloads.is_empty() {
        return H256::NIL;
    }
    let mut level: Vec<H256> = payloads.iter().map(|p| leaf_hash(p)).collect();
    while level.len() > 1 {
        level = fold_level(&level);
    }
    level[0]
}

fn fold_level(level: &[H256]) -> Vec<H256> {
    let mut next = Vec::with_capacity(level.len().div_ceil(2));
    for pair in level.chunks(2) {
        match pair {
            [left, right] => next.push(inner_hash(left, right)),
            [odd] => next.push(*odd),
            _ => unreachable!(),
        }
    }
    next
}

/// A Merkle membership proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the leaf this proof covers
    pub index: u32,
    /// Total number of leaves in the tree
    pub total: u32,
    /// Sibling hashes from the leaf up to the root
    pub branch: Vec<H256>,
}

impl MerkleProof {
    /// Build proofs for every leaf of the tree at once.
    ///
    /// Returns the root together with one proof per payload, in order.
    pub fn build(payloads: &[&[u8]]) -> (H256, Vec<MerkleProof>) {
        let total = payloads.len() as u32;
        if total == 0 {
            return (H256::NIL, Vec::new());
        }

        // Materialize every level of the tree.
        let mut levels: Vec<Vec<H256>> = vec![payloads.iter().map(|p| leaf_hash(p)).collect()];
        while levels.last().expect("at least one level").len() > 1 {
            let folded = fold_level(levels.last().expect("at least one level"));
            levels.push(folded);
        }
        let root = levels.last().expect("at least one level")[0];

        let proofs = (0..total)
            .map(|index| {
                let mut branch = Vec::new();
                let mut pos = index as usize;
                for level in &levels[..levels.len() - 1] {
                    let sibling = pos ^ 1;
                    if sibling < level.len() {
                        branch.push(level[sibling]);
                    }
                    pos /= 2;
                }
                MerkleProof {
                    index,
                    total,
                    branch,
                }
            })
            .collect();

        (root, proofs)
    }

    /// Verify that `payload` is the leaf at `self.index` under `root`.
    pub fn verify(&self, root: &H256, payload: &[u8]) -> bool {
        if self.index >= self.total {
            return false;
        }
        let mut hash = leaf_hash(payload);
        let mut pos = self.index as usize;
        let mut width = self.total as usize;
        let mut branch = self.branch.iter();

        while width > 1 {
            let sibling_pos = pos ^ 1;
            if sibling_pos < width {
                let Some(sibling) = branch.next() else {
                    return false;
                };
                hash = if pos % 2 == 0 {
                    inner_hash(&hash, sibling)
                } else {
                    inner_hash(sibling, &hash)
                };
            }
            pos /= 2;
            width = width.div_ceil(2);
        }

        branch.next().is_none() && hash == *root
    }
}
