//! Commits: the precommits that justified a decided block.
//!
//! A [`Commit`] is the compact record stored with each block; the
//! [`ExtendedCommit`] variant additionally carries per-vote extension data
//! and is persisted when vote extensions are enabled at the height.

use kestrel_crypto::Signature;
use serde::{Deserialize, Serialize};

use crate::{Address, BlockId, Timestamp};

/// How a validator appears in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockIdFlag {
    /// The validator did not vote
    Absent,
    /// The validator precommitted the committed block
    Commit,
    /// The validator precommitted nil
    Nil,
}

/// One validator's slot in a commit, ordered by validator index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    /// What the validator voted for
    pub flag: BlockIdFlag,
    /// Address of the validator
    pub validator_address: Address,
    /// Vote timestamp, Unix milliseconds
    pub timestamp_ms: Timestamp,
    /// Vote signature; absent when the validator did not vote
    pub signature: Option<Signature>,
}

impl CommitSig {
    /// A slot for a validator that did not vote.
    pub fn absent() -> Self {
        Self {
            flag: BlockIdFlag::Absent,
            validator_address: Address::ZERO,
            timestamp_ms: 0,
            signature: None,
        }
    }

    /// Whether this slot holds a vote for the committed block.
    pub fn is_commit(&self) -> bool {
        self.flag == BlockIdFlag::Commit
    }

    /// Whether this slot is empty.
    pub fn is_absent(&self) -> bool {
        self.flag == BlockIdFlag::Absent
    }
}

/// The precommits that committed a block at `(height, round)`.
///
/// Signature slots are ordered by validator index in the validator set of
/// the commit's height; absent validators keep their slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Height of the committed block
    pub height: u64,
    /// Round the commit was formed in
    pub round: i32,
    /// Id of the committed block
    pub block_id: BlockId,
    /// One slot per validator, by index
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// An empty commit, used before the first block.
    pub fn empty() -> Self {
        Self {
            height: 0,
            round: 0,
            block_id: BlockId::nil(),
            signatures: Vec::new(),
        }
    }

    /// Number of validator slots.
    pub fn size(&self) -> usize {
        self.signatures.len()
    }

    /// Number of slots that actually voted for the block.
    pub fn committed_count(&self) -> usize {
        self.signatures.iter().filter(|s| s.is_commit()).count()
    }
}

/// One validator's slot in an extended commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedCommitSig {
    /// The base commit slot
    pub commit_sig: CommitSig,
    /// Application extension attached to the precommit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<u8>,
    /// Signature over the extension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_signature: Option<Signature>,
}

/// A commit carrying vote-extension data for each signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedCommit {
    /// Height of the committed block
    pub height: u64,
    /// Round the commit was formed in
    pub round: i32,
    /// Id of the committed block
    pub block_id: BlockId,
    /// One slot per validator, by index
    pub signatures: Vec<ExtendedCommitSig>,
}

impl ExtendedCommit {
    /// An empty extended commit, used before the first block.
    pub fn empty() -> Self {
        Self {
            height: 0,
            round: 0,
            block_id: BlockId::nil(),
            signatures: Vec::new(),
        }
    }

    /// Drop the extension data, keeping the plain commit.
    pub fn to_commit(&self) -> Commit {
        Commit {
            height: self.height,
            round: self.round,
            block_id: self.block_id.clone(),
            signatures: self.signatures.iter().map(|s| s.commit_sig.clone()).collect(),
        }
    }
}
