//! Blocks, block ids and headers.
//!
//! A [`BlockId`] is the pair `(hash, part_set_header)`: the hash commits to
//! the block contents, the part-set header commits to its wire encoding so
//! peers can fetch and verify individual parts.

use serde::{Deserialize, Serialize};

use crate::{Address, Commit, Error, Evidence, Result, Timestamp, H256};

/// Size of one block part in bytes.
pub const BLOCK_PART_SIZE_BYTES: usize = 65_536;

/// Commitment to the part-set encoding of a block: part count and the
/// Merkle root over part payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    /// Number of parts
    pub total: u32,
    /// Merkle root over the ordered part payloads
    pub hash: H256,
}

impl PartSetHeader {
    /// Create a part-set header.
    pub fn new(total: u32, hash: H256) -> Self {
        Self { total, hash }
    }

    /// The nil header: zero parts, nil root.
    pub fn nil() -> Self {
        Self {
            total: 0,
            hash: H256::NIL,
        }
    }

    /// Whether this is the nil header.
    pub fn is_nil(&self) -> bool {
        self.total == 0 && self.hash.is_nil()
    }
}

impl std::fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.total, self.hash.short())
    }
}

/// Identifies one block: content hash plus part-set commitment.
///
/// The nil block id (all-zero hash, nil part-set header) means "no block"
/// and is what nil votes carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// Hash of the block
    pub hash: H256,
    /// Commitment to the block's part-set encoding
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    /// Create a block id.
    pub fn new(hash: H256, part_set_header: PartSetHeader) -> Self {
        Self {
            hash,
            part_set_header,
        }
    }

    /// The nil block id.
    pub fn nil() -> Self {
        Self {
            hash: H256::NIL,
            part_set_header: PartSetHeader::nil(),
        }
    }

    /// Whether this is the nil block id.
    pub fn is_nil(&self) -> bool {
        self.hash.is_nil() && self.part_set_header.is_nil()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            write!(f, "{}({})", self.hash.short(), self.part_set_header)
        }
    }
}

/// Block header: metadata and commitments over the block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Chain identifier, preventing cross-chain replay
    pub chain_id: String,
    /// Block height
    pub height: u64,
    /// Proposer-assigned block time, Unix milliseconds
    pub time_ms: Timestamp,
    /// Id of the previous block; nil for the initial height
    pub last_block_id: BlockId,
    /// Hash of the commit for the previous block
    pub last_commit_hash: H256,
    /// Hash over the transaction data
    pub data_hash: H256,
    /// Hash of the validator set for this height
    pub validators_hash: H256,
    /// Application state hash after the previous block
    pub app_hash: H256,
    /// Hash over the evidence list
    pub evidence_hash: H256,
    /// Address of the proposer that built this block
    pub proposer_address: Address,
}

impl Header {
    /// Hash of the canonical header encoding. This is *the* block hash.
    pub fn hash(&self) -> H256 {
        let bytes = serde_json::to_vec(self).expect("header serialization cannot fail");
        H256::keccak256(&bytes)
    }
}

/// A complete block: header, transaction data, evidence, and the commit
/// for the previous height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The header
    pub header: Header,
    /// Opaque transactions
    pub data: Vec<Vec<u8>>,
    /// Evidence of validator misbehavior
    pub evidence: Vec<Evidence>,
    /// Precommits that committed the previous block
    pub last_commit: Commit,
}

impl Block {
    /// Assemble a block, filling in the body commitments on the header.
    pub fn new(
        mut header: Header,
        data: Vec<Vec<u8>>,
        evidence: Vec<Evidence>,
        last_commit: Commit,
    ) -> Self {
        header.data_hash = hash_of(&data);
        header.evidence_hash = hash_of(&evidence);
        header.last_commit_hash = hash_of(&last_commit);
        Self {
            header,
            data,
            evidence,
            last_commit,
        }
    }

    /// The block hash.
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    /// Whether this block hashes to `hash`.
    pub fn hashes_to(&self, hash: &H256) -> bool {
        &self.hash() == hash
    }

    /// The canonical wire encoding, which the part set splits.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("block serialization cannot fail")
    }

    /// Decode a block from its canonical wire encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedBlock(e.to_string()))
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.encode().len()
    }
}

fn hash_of<T: Serialize>(value: &T) -> H256 {
    let bytes = serde_json::to_vec(value).expect("serialization cannot fail");
    H256::keccak256(&bytes)
}

/// Header and id of a stored block, as kept by the block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Id of the block
    pub block_id: BlockId,
    /// The block's header
    pub header: Header,
}
