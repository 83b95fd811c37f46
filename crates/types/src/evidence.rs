//! Equivocation evidence.
//!
//! Two votes from the same validator at the same `(height, round, type)` for
//! different blocks prove double-signing. The driver hands conflicting peer
//! votes to the evidence pool; validated evidence eventually lands in a
//! block's evidence list.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, Vote};

/// Evidence carried in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evidence {
    /// Proof that a validator signed two conflicting votes
    DuplicateVote(DuplicateVoteEvidence),
}

/// Proof that a validator double-signed: two conflicting votes at the same
/// `(height, round, type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    /// First conflicting vote
    pub vote_a: Vote,
    /// Second conflicting vote
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    /// Build evidence from two conflicting votes.
    ///
    /// Checks the structural requirements only; signatures are verified
    /// against the validator set by the evidence pool.
    pub fn new(vote_a: Vote, vote_b: Vote) -> Result<Self> {
        if vote_a.validator_address != vote_b.validator_address {
            return Err(Error::InvalidEvidence(format!(
                "votes from different validators: {} vs {}",
                vote_a.validator_address, vote_b.validator_address
            )));
        }
        if vote_a.height != vote_b.height {
            return Err(Error::InvalidEvidence(format!(
                "votes at different heights: {} vs {}",
                vote_a.height, vote_b.height
            )));
        }
        if vote_a.round != vote_b.round {
            return Err(Error::InvalidEvidence(format!(
                "votes in different rounds: {} vs {}",
                vote_a.round, vote_b.round
            )));
        }
        if vote_a.vote_type != vote_b.vote_type {
            return Err(Error::InvalidEvidence(format!(
                "votes of different types: {} vs {}",
                vote_a.vote_type, vote_b.vote_type
            )));
        }
        if vote_a.block_id == vote_b.block_id {
            return Err(Error::InvalidEvidence(
                "votes are for the same block; not equivocation".to_string(),
            ));
        }
        Ok(Self { vote_a, vote_b })
    }

    /// Height the equivocation happened at.
    pub fn height(&self) -> u64 {
        self.vote_a.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, BlockId, PartSetHeader, VoteType, H256};

    fn vote(hash: H256, addr: Address, round: i32) -> Vote {
        Vote::new(
            VoteType::Prevote,
            7,
            round,
            BlockId::new(hash, PartSetHeader::new(1, hash)),
            0,
            addr,
            0,
        )
    }

    #[test]
    fn test_conflicting_votes_accepted() {
        let addr = Address::new([1u8; 20]);
        let ev = DuplicateVoteEvidence::new(
            vote(H256::keccak256(b"a"), addr, 0),
            vote(H256::keccak256(b"b"), addr, 0),
        )
        .unwrap();
        assert_eq!(ev.height(), 7);
    }

    #[test]
    fn test_same_block_rejected() {
        let addr = Address::new([1u8; 20]);
        let hash = H256::keccak256(b"a");
        assert!(DuplicateVoteEvidence::new(vote(hash, addr, 0), vote(hash, addr, 0)).is_err());
    }

    #[test]
    fn test_different_validator_rejected() {
        assert!(DuplicateVoteEvidence::new(
            vote(H256::keccak256(b"a"), Address::new([1u8; 20]), 0),
            vote(H256::keccak256(b"b"), Address::new([2u8; 20]), 0),
        )
        .is_err());
    }

    #[test]
    fn test_different_round_rejected() {
        let addr = Address::new([1u8; 20]);
        assert!(DuplicateVoteEvidence::new(
            vote(H256::keccak256(b"a"), addr, 0),
            vote(H256::keccak256(b"b"), addr, 1),
        )
        .is_err());
    }
}
