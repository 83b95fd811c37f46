//! Block part sets.
//!
//! A block's canonical encoding is split into fixed-size parts that gossip
//! independently. A [`PartSet`] accumulates parts in any order, verifying
//! each against the set's Merkle root, and reassembles the block once every
//! index is present.

use serde::{Deserialize, Serialize};

use crate::{merkle::MerkleProof, Block, BlockId, Error, PartSetHeader, Result, H256};
use crate::block::BLOCK_PART_SIZE_BYTES;

/// One part of an encoded block, with its membership proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Index of this part, 0-based
    pub index: u32,
    /// Payload bytes
    pub bytes: Vec<u8>,
    /// Proof that the payload is leaf `index` under the set's root
    pub proof: MerkleProof,
}

/// Accumulator for the ordered parts covering one encoded block.
///
/// Complete part sets reconstruct exactly one block whose hash must equal
/// the hash in the proposal's block id; the caller checks that via
/// [`PartSet::reassemble`].
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Split a block into parts, building the Merkle commitment.
    pub fn from_block(block: &Block) -> Self {
        let encoded = block.encode();
        let chunks: Vec<&[u8]> = encoded.chunks(BLOCK_PART_SIZE_BYTES).collect();
        let (root, proofs) = MerkleProof::build(&chunks);

        let parts: Vec<Option<Part>> = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (chunk, proof))| {
                Some(Part {
                    index: index as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();

        let total = parts.len() as u32;
        let byte_size = encoded.len();
        Self {
            header: PartSetHeader::new(total, root),
            parts,
            count: total,
            byte_size,
        }
    }

    /// An empty accumulator expecting parts for `header`.
    ///
    /// Used when we learn a block id (from a proposal, a polka, or a commit)
    /// before having any of its parts.
    pub fn from_header(header: PartSetHeader) -> Self {
        let total = header.total as usize;
        Self {
            header,
            parts: vec![None; total],
            count: 0,
            byte_size: 0,
        }
    }

    /// The part-set commitment.
    pub fn header(&self) -> &PartSetHeader {
        &self.header
    }

    /// Whether this set was built for `header`.
    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        &self.header == header
    }

    /// Number of parts present.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Total number of parts expected.
    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// Bytes accumulated so far.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Whether every part is present.
    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Fetch one part, if present.
    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)?.as_ref()
    }

    /// Add a part, verifying its Merkle proof against the set's root.
    ///
    /// Returns `Ok(false)` for a duplicate of an already-present part.
    pub fn add_part(&mut self, part: Part) -> Result<bool> {
        if part.index >= self.header.total {
            return Err(Error::UnexpectedPartIndex {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        if !part.proof.verify(&self.header.hash, &part.bytes) {
            return Err(Error::InvalidPartProof {
                index: part.index,
                root: self.header.hash,
            });
        }

        self.count += 1;
        self.byte_size += part.bytes.len();
        let index = part.index as usize;
        self.parts[index] = Some(part);
        Ok(true)
    }

    /// Decode the block from a complete part set, without checking its
    /// hash. Callers match the result against the block id they expect.
    pub fn decode_block(&self) -> Result<Block> {
        let mut bytes = Vec::with_capacity(self.byte_size);
        for part in &self.parts {
            let part = part
                .as_ref()
                .ok_or_else(|| Error::MalformedBlock("part set is incomplete".to_string()))?;
            bytes.extend_from_slice(&part.bytes);
        }
        Block::decode(&bytes)
    }

    /// Reassemble the block from a complete part set and check that it
    /// hashes to `block_id.hash`.
    pub fn reassemble(&self, block_id: &BlockId) -> Result<Block> {
        debug_assert!(self.is_complete());
        let block = self.decode_block()?;
        let actual = block.hash();
        if actual != block_id.hash {
            return Err(Error::BlockHashMismatch {
                expected: block_id.hash,
                actual,
            });
        }
        Ok(block)
    }

    /// The block id this part set belongs to, given the block hash.
    pub fn block_id(&self, hash: H256) -> BlockId {
        BlockId::new(hash, self.header.clone())
    }
}
