//! # Kestrel Types
//!
//! Core data model for the Kestrel consensus engine.
//!
//! This crate provides the fundamental types consensus operates on:
//! - [`Address`] and [`H256`] - validator addresses and 32-byte hashes
//! - [`Block`], [`Header`], [`BlockId`] - block structures
//! - [`Part`] and [`PartSet`] - the block-part gossip encoding
//! - [`Vote`], [`Proposal`], [`Commit`] - consensus messages
//! - [`Validator`] and [`ValidatorSet`] - the weighted validator set with
//!   its proposer rotation
//! - [`ConsensusParams`] and [`State`] - chain-wide parameters and the
//!   consensus view of chain state
//!
//! ## Example
//!
//! ```rust
//! use kestrel_types::{H256, BlockId, PartSetHeader};
//!
//! let hash = H256::keccak256(b"hello world");
//! let id = BlockId::new(hash, PartSetHeader::new(1, hash));
//! assert!(!id.is_nil());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod address;
pub mod block;
pub mod commit;
pub mod error;
pub mod evidence;
pub mod hash;
pub mod merkle;
pub mod params;
pub mod part_set;
pub mod proposal;
pub mod state;
pub mod time;
pub mod validator;
pub mod vote;

// Re-export main types at crate root
pub use address::Address;
pub use block::{Block, BlockId, BlockMeta, Header, PartSetHeader, BLOCK_PART_SIZE_BYTES};
pub use commit::{BlockIdFlag, Commit, CommitSig, ExtendedCommit, ExtendedCommitSig};
pub use error::{Error, Result};
pub use evidence::{DuplicateVoteEvidence, Evidence};
pub use hash::H256;
pub use merkle::{merkle_root, MerkleProof};
pub use params::{
    AbciParams, BlockParams, ConsensusParams, EvidenceParams, SynchronyParams, TimeoutParams,
    ValidatorParams, VersionParams,
};
pub use part_set::{Part, PartSet};
pub use proposal::Proposal;
pub use state::State;
pub use time::{now_ms, Timestamp};
pub use validator::{Validator, ValidatorSet};
pub use vote::{domains, Vote, VoteType};
