//! Vote collection and two-thirds threshold detection.
//!
//! A [`VoteSet`] tallies votes for one `(height, round, type)` position over
//! a weighted validator set. At most one block id can ever cross the
//! two-thirds threshold within a set; conflicting votes from one validator
//! are surfaced as a dedicated error carrying both votes so the driver can
//! hand them to the evidence pool.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, trace};

use kestrel_types::{
    Address, BlockId, BlockIdFlag, Commit, CommitSig, ExtendedCommit, ExtendedCommitSig,
    ValidatorSet, Vote, VoteType,
};

use crate::types::PeerId;

/// A pair of votes from the same validator for different blocks at the same
/// `(height, round, type)` position.
#[derive(Debug, Clone)]
pub struct ConflictingVotes {
    /// The vote already in the set
    pub existing: Vote,
    /// The vote that conflicted with it
    pub conflicting: Vote,
}

/// Errors from vote-set operations.
#[derive(Debug, Error)]
pub enum VoteSetError {
    /// Vote is for a different height
    #[error("vote height {vote_height} does not match set height {set_height}")]
    WrongHeight {
        /// Height on the vote
        vote_height: u64,
        /// Height of the set
        set_height: u64,
    },

    /// Vote is for a different round
    #[error("vote round {vote_round} does not match set round {set_round}")]
    WrongRound {
        /// Round on the vote
        vote_round: i32,
        /// Round of the set
        set_round: i32,
    },

    /// Vote type does not match the set
    #[error("vote type mismatch")]
    WrongType,

    /// Vote is for a round this height-vote-set is not tracking yet
    #[error("vote round {vote_round} is beyond tracked round {tracked}")]
    UnwantedRound {
        /// Round on the vote
        vote_round: i32,
        /// Highest tracked round
        tracked: i32,
    },

    /// Validator index out of range
    #[error("invalid validator index {index} (set size {size})")]
    InvalidValidatorIndex {
        /// Index on the vote
        index: u32,
        /// Size of the validator set
        size: usize,
    },

    /// Vote address does not match the validator at its index
    #[error("vote address {vote_address} does not match validator {expected} at index {index}")]
    AddressMismatch {
        /// Address on the vote
        vote_address: Address,
        /// Address registered at that index
        expected: Address,
        /// The index in question
        index: u32,
    },

    /// Vote carries no signature
    #[error("vote from {0} is unsigned")]
    UnsignedVote(Address),

    /// Vote signature failed verification
    #[error("invalid signature on vote from {0}")]
    InvalidSignature(Address),

    /// Non-nil precommit is missing its required extension signature
    #[error("vote from {0} is missing its vote extension")]
    MissingExtension(Address),

    /// The same validator voted for two different blocks
    #[error("conflicting votes from validator {}", .0.existing.validator_address)]
    Conflicting(Box<ConflictingVotes>),

    /// A commit could not be rebuilt into a valid vote set
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
}

/// Tally of votes for one `(height, round, type)` position.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: i32,
    vote_type: VoteType,
    validators: ValidatorSet,
    /// Non-nil precommits must carry extension data when true
    require_extensions: bool,
    /// One slot per validator, by index
    votes: Vec<Option<Vote>>,
    /// Voting power per block id
    power_by_block: HashMap<BlockId, u64>,
    /// Total power that has voted for anything
    sum_power: u64,
    /// The unique block id past the two-thirds threshold, once reached
    maj23: Option<BlockId>,
    /// Conflicting votes kept for evidence
    conflicts: Vec<Vote>,
}

impl VoteSet {
    /// Create an empty vote set.
    pub fn new(
        chain_id: String,
        height: u64,
        round: i32,
        vote_type: VoteType,
        validators: ValidatorSet,
        require_extensions: bool,
    ) -> Self {
        let size = validators.len();
        Self {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            require_extensions,
            votes: vec![None; size],
            power_by_block: HashMap::new(),
            sum_power: 0,
            maj23: None,
            conflicts: Vec::new(),
        }
    }

    /// Height of this set.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Round of this set.
    pub fn round(&self) -> i32 {
        self.round
    }

    /// Vote type of this set.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Add a vote, verifying position, identity and signature.
    ///
    /// Returns `Ok(false)` for an exact duplicate. A vote for a different
    /// block than the validator's earlier vote returns
    /// [`VoteSetError::Conflicting`] carrying both votes; the conflicting
    /// vote is retained for evidence but does not change the tally.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        self.validate_vote(&vote)?;
        self.add_verified_vote(vote)
    }

    fn validate_vote(&self, vote: &Vote) -> Result<(), VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                vote_height: vote.height,
                set_height: self.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::WrongRound {
                vote_round: vote.round,
                set_round: self.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::WrongType);
        }

        let validator = self.validators.get_by_index(vote.validator_index).ok_or(
            VoteSetError::InvalidValidatorIndex {
                index: vote.validator_index,
                size: self.validators.len(),
            },
        )?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::AddressMismatch {
                vote_address: vote.validator_address,
                expected: validator.address,
                index: vote.validator_index,
            });
        }

        match &vote.signature {
            None => return Err(VoteSetError::UnsignedVote(vote.validator_address)),
            Some(_) => {
                if !vote.verify(&self.chain_id, &validator.pub_key) {
                    return Err(VoteSetError::InvalidSignature(vote.validator_address));
                }
            }
        }

        if self.require_extensions
            && vote.vote_type == VoteType::Precommit
            && !vote.block_id.is_nil()
            && vote.extension_signature.is_none()
        {
            return Err(VoteSetError::MissingExtension(vote.validator_address));
        }

        Ok(())
    }

    /// Insert a vote whose position, identity and signature have already
    /// been checked. Used when rebuilding a set from a stored commit.
    fn add_verified_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        let index = vote.validator_index as usize;
        if index >= self.votes.len() {
            return Err(VoteSetError::InvalidValidatorIndex {
                index: vote.validator_index,
                size: self.votes.len(),
            });
        }

        if let Some(existing) = &self.votes[index] {
            if existing.block_id == vote.block_id {
                return Ok(false);
            }
            let conflict = ConflictingVotes {
                existing: existing.clone(),
                conflicting: vote.clone(),
            };
            // Keep the conflicting vote for evidence, tally unchanged.
            self.conflicts.push(vote);
            return Err(VoteSetError::Conflicting(Box::new(conflict)));
        }

        let power = self
            .validators
            .get_by_index(vote.validator_index)
            .map(|v| v.voting_power)
            .unwrap_or(0);

        trace!(
            height = self.height,
            round = self.round,
            vote_type = %self.vote_type,
            validator = %vote.validator_address,
            block = %vote.block_id.hash.short(),
            power,
            "adding vote"
        );

        let tally = self
            .power_by_block
            .entry(vote.block_id.clone())
            .or_insert(0);
        *tally += power;
        let tally = *tally;
        self.sum_power += power;

        if self.maj23.is_none() && self.validators.has_two_thirds(tally) {
            debug!(
                height = self.height,
                round = self.round,
                vote_type = %self.vote_type,
                block = %vote.block_id.hash.short(),
                power = tally,
                "two-thirds majority reached"
            );
            self.maj23 = Some(vote.block_id.clone());
        }

        self.votes[index] = Some(vote);
        Ok(true)
    }

    /// The unique block id holding more than two thirds of the power.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23.clone()
    }

    /// Whether more than two thirds of the power has voted for anything.
    pub fn two_thirds_any(&self) -> bool {
        self.validators.has_two_thirds(self.sum_power)
    }

    /// Whether every validator has voted.
    pub fn has_all(&self) -> bool {
        self.votes.iter().all(|v| v.is_some())
    }

    /// The vote from the validator at `index`, if any.
    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize)?.as_ref()
    }

    /// The vote from `address`, if any.
    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.get_by_index(index)
    }

    /// All votes currently in the set, in validator order.
    pub fn list(&self) -> Vec<&Vote> {
        self.votes.iter().flatten().collect()
    }

    /// Total power that has voted.
    pub fn voted_power(&self) -> u64 {
        self.sum_power
    }

    /// Conflicting votes retained for evidence.
    pub fn conflicts(&self) -> &[Vote] {
        &self.conflicts
    }

    /// Build a commit from a precommit set with a non-nil majority.
    pub fn make_commit(&self) -> Option<Commit> {
        self.make_extended_commit().map(|ec| ec.to_commit())
    }

    /// Build an extended commit (per-vote extensions included) from a
    /// precommit set with a non-nil majority.
    pub fn make_extended_commit(&self) -> Option<ExtendedCommit> {
        debug_assert_eq!(self.vote_type, VoteType::Precommit);
        let block_id = self.maj23.clone()?;
        if block_id.is_nil() {
            return None;
        }

        let signatures = self
            .votes
            .iter()
            .map(|slot| match slot {
                Some(vote) => {
                    let flag = if vote.block_id == block_id {
                        BlockIdFlag::Commit
                    } else if vote.is_nil() {
                        BlockIdFlag::Nil
                    } else {
                        BlockIdFlag::Absent
                    };
                    ExtendedCommitSig {
                        commit_sig: CommitSig {
                            flag,
                            validator_address: vote.validator_address,
                            timestamp_ms: vote.timestamp_ms,
                            signature: vote.signature,
                        },
                        extension: vote.extension.clone(),
                        extension_signature: vote.extension_signature,
                    }
                }
                None => ExtendedCommitSig {
                    commit_sig: CommitSig::absent(),
                    extension: Vec::new(),
                    extension_signature: None,
                },
            })
            .collect();

        Some(ExtendedCommit {
            height: self.height,
            round: self.round,
            block_id,
            signatures,
        })
    }

    /// Rebuild the precommit set a stored commit was made from.
    ///
    /// Signatures come from our own store, so they are trusted; the rebuilt
    /// set must still carry a two-thirds majority for the commit's block.
    pub fn from_commit(
        chain_id: String,
        validators: ValidatorSet,
        commit: &Commit,
    ) -> Result<Self, VoteSetError> {
        let mut set = Self::new(
            chain_id,
            commit.height,
            commit.round,
            VoteType::Precommit,
            validators,
            false,
        );
        for (index, sig) in commit.signatures.iter().enumerate() {
            if sig.is_absent() {
                continue;
            }
            let block_id = match sig.flag {
                BlockIdFlag::Commit => commit.block_id.clone(),
                BlockIdFlag::Nil => BlockId::nil(),
                BlockIdFlag::Absent => unreachable!(),
            };
            let mut vote = Vote::new(
                VoteType::Precommit,
                commit.height,
                commit.round,
                block_id,
                sig.timestamp_ms,
                sig.validator_address,
                index as u32,
            );
            vote.signature = sig.signature;
            set.add_verified_vote(vote)?;
        }
        if set.two_thirds_majority().as_ref() != Some(&commit.block_id) {
            return Err(VoteSetError::InvalidCommit(
                "commit does not have a two-thirds majority".to_string(),
            ));
        }
        Ok(set)
    }

    /// Rebuild the precommit set a stored extended commit was made from.
    pub fn from_extended_commit(
        chain_id: String,
        validators: ValidatorSet,
        commit: &ExtendedCommit,
    ) -> Result<Self, VoteSetError> {
        let mut set = Self::new(
            chain_id,
            commit.height,
            commit.round,
            VoteType::Precommit,
            validators,
            true,
        );
        for (index, ext_sig) in commit.signatures.iter().enumerate() {
            let sig = &ext_sig.commit_sig;
            if sig.is_absent() {
                continue;
            }
            let block_id = match sig.flag {
                BlockIdFlag::Commit => commit.block_id.clone(),
                BlockIdFlag::Nil => BlockId::nil(),
                BlockIdFlag::Absent => unreachable!(),
            };
            let mut vote = Vote::new(
                VoteType::Precommit,
                commit.height,
                commit.round,
                block_id,
                sig.timestamp_ms,
                sig.validator_address,
                index as u32,
            );
            vote.signature = sig.signature;
            vote.extension = ext_sig.extension.clone();
            vote.extension_signature = ext_sig.extension_signature;
            set.add_verified_vote(vote)?;
        }
        if set.two_thirds_majority().as_ref() != Some(&commit.block_id) {
            return Err(VoteSetError::InvalidCommit(
                "extended commit does not have a two-thirds majority".to_string(),
            ));
        }
        Ok(set)
    }
}

/// How many rounds ahead of us a single peer may open vote sets for.
const MAX_PEER_CATCHUP_ROUNDS: usize = 2;

/// Vote sets for every round of one height.
///
/// Tracks the current round plus the one after it, so a two-thirds showing
/// at `round + 1` can trigger a round skip before we get there ourselves.
/// Each peer may additionally open a bounded number of further-future
/// rounds, which is what lets a lagging node skip straight to wherever the
/// network is.
#[derive(Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: ValidatorSet,
    require_extensions: bool,
    round: i32,
    prevotes: BTreeMap<i32, VoteSet>,
    precommits: BTreeMap<i32, VoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<i32>>,
}

impl HeightVoteSet {
    /// Create the vote sets for `height`, tracking rounds 0 and 1.
    pub fn new(
        chain_id: String,
        height: u64,
        validators: ValidatorSet,
        require_extensions: bool,
    ) -> Self {
        let mut hvs = Self {
            chain_id,
            height,
            validators,
            require_extensions,
            round: 0,
            prevotes: BTreeMap::new(),
            precommits: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        hvs.add_round(0);
        hvs.add_round(1);
        hvs
    }

    /// Height covered by these sets.
    pub fn height(&self) -> u64 {
        self.height
    }

    fn add_round(&mut self, round: i32) {
        if self.prevotes.contains_key(&round) {
            return;
        }
        self.prevotes.insert(
            round,
            VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Prevote,
                self.validators.clone(),
                false,
            ),
        );
        self.precommits.insert(
            round,
            VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Precommit,
                self.validators.clone(),
                self.require_extensions,
            ),
        );
    }

    /// Advance the tracked round, keeping one round of headroom for skips.
    pub fn set_round(&mut self, round: i32) {
        let start = self.round.saturating_add(1).min(round);
        for r in start..=round {
            self.add_round(r);
        }
        self.round = round;
    }

    /// Route a vote to the right set.
    ///
    /// Votes beyond `tracked round + 1` are rejected unless the sending
    /// peer still has catchup rounds left.
    pub fn add_vote(&mut self, vote: Vote, peer_id: Option<&PeerId>) -> Result<bool, VoteSetError> {
        if vote.round > self.round + 1 {
            let allowed = match peer_id {
                Some(peer) => {
                    let rounds = self.peer_catchup_rounds.entry(peer.clone()).or_default();
                    if rounds.contains(&vote.round) {
                        true
                    } else if rounds.len() < MAX_PEER_CATCHUP_ROUNDS {
                        rounds.push(vote.round);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if !allowed {
                return Err(VoteSetError::UnwantedRound {
                    vote_round: vote.round,
                    tracked: self.round + 1,
                });
            }
        }
        self.add_round(vote.round);
        let set = match vote.vote_type {
            VoteType::Prevote => self.prevotes.get_mut(&vote.round),
            VoteType::Precommit => self.precommits.get_mut(&vote.round),
        };
        set.expect("round added above").add_vote(vote)
    }

    /// The prevote set for `round`, if tracked.
    pub fn prevotes(&self, round: i32) -> Option<&VoteSet> {
        self.prevotes.get(&round)
    }

    /// The precommit set for `round`, if tracked.
    pub fn precommits(&self, round: i32) -> Option<&VoteSet> {
        self.precommits.get(&round)
    }

    /// The most recent round with a prevote majority, and the block it
    /// was for.
    pub fn pol_info(&self) -> Option<(i32, BlockId)> {
        self.prevotes
            .iter()
            .rev()
            .find_map(|(round, set)| set.two_thirds_majority().map(|id| (*round, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_crypto::Keypair;
    use kestrel_types::{PartSetHeader, Validator, H256};

    const CHAIN: &str = "test-chain";

    struct Fixture {
        keypairs: Vec<Keypair>,
        validators: ValidatorSet,
    }

    fn fixture(n: usize) -> Fixture {
        let keypairs: Vec<Keypair> = (0..n)
            .map(|i| Keypair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let validators = ValidatorSet::new(
            keypairs
                .iter()
                .map(|k| Validator::new(k.public_key(), 1))
                .collect(),
        );
        Fixture {
            keypairs,
            validators,
        }
    }

    impl Fixture {
        fn signed_vote(&self, seat: u32, vote_type: VoteType, block_id: BlockId) -> Vote {
            let validator = self.validators.get_by_index(seat).unwrap().clone();
            let keypair = self
                .keypairs
                .iter()
                .find(|k| Address::from_pub_key(&k.public_key()) == validator.address)
                .unwrap();
            let mut vote = Vote::new(vote_type, 1, 0, block_id, 1000, validator.address, seat);
            vote.signature = Some(keypair.sign(&vote.sign_bytes(CHAIN)));
            vote
        }
    }

    fn block_id(tag: &[u8]) -> BlockId {
        let hash = H256::keccak256(tag);
        BlockId::new(hash, PartSetHeader::new(1, hash))
    }

    #[test]
    fn test_majority_requires_strictly_more_than_two_thirds() {
        let fx = fixture(4);
        let mut set = VoteSet::new(
            CHAIN.into(),
            1,
            0,
            VoteType::Prevote,
            fx.validators.clone(),
            false,
        );
        let id = block_id(b"b");

        set.add_vote(fx.signed_vote(0, VoteType::Prevote, id.clone())).unwrap();
        set.add_vote(fx.signed_vote(1, VoteType::Prevote, id.clone())).unwrap();
        assert!(set.two_thirds_majority().is_none());

        set.add_vote(fx.signed_vote(2, VoteType::Prevote, id.clone())).unwrap();
        assert_eq!(set.two_thirds_majority(), Some(id));
        assert!(set.two_thirds_any());
        assert!(!set.has_all());

        set.add_vote(fx.signed_vote(3, VoteType::Prevote, BlockId::nil())).unwrap();
        assert!(set.has_all());
    }

    #[test]
    fn test_duplicate_vote_is_noop() {
        let fx = fixture(4);
        let mut set = VoteSet::new(
            CHAIN.into(),
            1,
            0,
            VoteType::Prevote,
            fx.validators.clone(),
            false,
        );
        let vote = fx.signed_vote(0, VoteType::Prevote, block_id(b"b"));

        assert!(set.add_vote(vote.clone()).unwrap());
        assert!(!set.add_vote(vote).unwrap());
        assert_eq!(set.voted_power(), 1);
    }

    #[test]
    fn test_conflicting_vote_carries_both_votes() {
        let fx = fixture(4);
        let mut set = VoteSet::new(
            CHAIN.into(),
            1,
            0,
            VoteType::Prevote,
            fx.validators.clone(),
            false,
        );
        let first = fx.signed_vote(0, VoteType::Prevote, block_id(b"b1"));
        let second = fx.signed_vote(0, VoteType::Prevote, block_id(b"b2"));

        set.add_vote(first.clone()).unwrap();
        let err = set.add_vote(second.clone()).unwrap_err();
        match err {
            VoteSetError::Conflicting(cv) => {
                assert_eq!(cv.existing, first);
                assert_eq!(cv.conflicting, second);
            }
            other => panic!("expected conflict, got {other}"),
        }

        // The first vote wins the tally; the conflict is retained.
        assert_eq!(set.voted_power(), 1);
        assert_eq!(set.conflicts().len(), 1);
        assert_eq!(set.get_by_index(0), Some(&first));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let fx = fixture(4);
        let mut set = VoteSet::new(
            CHAIN.into(),
            1,
            0,
            VoteType::Prevote,
            fx.validators.clone(),
            false,
        );
        let mut vote = fx.signed_vote(0, VoteType::Prevote, block_id(b"b"));
        vote.round = 0;
        vote.timestamp_ms += 1; // signature no longer covers the content

        assert!(matches!(
            set.add_vote(vote),
            Err(VoteSetError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_address_index_mismatch_rejected() {
        let fx = fixture(4);
        let mut set = VoteSet::new(
            CHAIN.into(),
            1,
            0,
            VoteType::Prevote,
            fx.validators.clone(),
            false,
        );
        let mut vote = fx.signed_vote(0, VoteType::Prevote, block_id(b"b"));
        vote.validator_index = 1;

        assert!(matches!(
            set.add_vote(vote),
            Err(VoteSetError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_extension_rejected_when_required() {
        let fx = fixture(4);
        let mut set = VoteSet::new(
            CHAIN.into(),
            1,
            0,
            VoteType::Precommit,
            fx.validators.clone(),
            true,
        );
        let vote = fx.signed_vote(0, VoteType::Precommit, block_id(b"b"));
        assert!(matches!(
            set.add_vote(vote),
            Err(VoteSetError::MissingExtension(_))
        ));

        // Nil precommits carry no extension even when required.
        let nil_vote = fx.signed_vote(1, VoteType::Precommit, BlockId::nil());
        assert!(set.add_vote(nil_vote).unwrap());
    }

    #[test]
    fn test_commit_roundtrip() {
        let fx = fixture(4);
        let mut set = VoteSet::new(
            CHAIN.into(),
            1,
            0,
            VoteType::Precommit,
            fx.validators.clone(),
            false,
        );
        let id = block_id(b"decided");
        for seat in 0..3 {
            set.add_vote(fx.signed_vote(seat, VoteType::Precommit, id.clone())).unwrap();
        }
        set.add_vote(fx.signed_vote(3, VoteType::Precommit, BlockId::nil())).unwrap();

        let commit = set.make_commit().unwrap();
        assert_eq!(commit.block_id, id);
        assert_eq!(commit.committed_count(), 3);
        assert_eq!(commit.size(), 4);

        let rebuilt =
            VoteSet::from_commit(CHAIN.into(), fx.validators.clone(), &commit).unwrap();
        assert_eq!(rebuilt.two_thirds_majority(), Some(id));
        assert!(rebuilt.has_all());
    }

    #[test]
    fn test_from_commit_without_majority_rejected() {
        let fx = fixture(4);
        let id = block_id(b"decided");
        let commit = Commit {
            height: 1,
            round: 0,
            block_id: id,
            signatures: vec![CommitSig::absent(); 4],
        };
        assert!(matches!(
            VoteSet::from_commit(CHAIN.into(), fx.validators.clone(), &commit),
            Err(VoteSetError::InvalidCommit(_))
        ));
    }

    #[test]
    fn test_height_vote_set_round_headroom() {
        let fx = fixture(4);
        let mut hvs = HeightVoteSet::new(CHAIN.into(), 1, fx.validators.clone(), false);

        let validator = fx.validators.get_by_index(0).unwrap().clone();
        let kp = fx
            .keypairs
            .iter()
            .find(|k| Address::from_pub_key(&k.public_key()) == validator.address)
            .unwrap();

        // Round 1 (current + 1) is accepted even without a peer.
        let mut vote = fx.signed_vote(0, VoteType::Prevote, block_id(b"b"));
        vote.round = 1;
        vote.signature = Some(kp.sign(&vote.sign_bytes(CHAIN)));
        assert!(hvs.add_vote(vote.clone(), None).unwrap());

        // Round 3 is rejected for internal votes until we catch up.
        let mut far = vote.clone();
        far.round = 3;
        far.signature = Some(kp.sign(&far.sign_bytes(CHAIN)));
        assert!(matches!(
            hvs.add_vote(far.clone(), None),
            Err(VoteSetError::UnwantedRound { .. })
        ));

        hvs.set_round(2);
        assert!(hvs.add_vote(far, None).unwrap());
    }

    #[test]
    fn test_peer_catchup_rounds() {
        let fx = fixture(4);
        let mut hvs = HeightVoteSet::new(CHAIN.into(), 1, fx.validators.clone(), false);
        let peer: PeerId = "peer-1".to_string();

        let validator = fx.validators.get_by_index(0).unwrap().clone();
        let kp = fx
            .keypairs
            .iter()
            .find(|k| Address::from_pub_key(&k.public_key()) == validator.address)
            .unwrap();

        // A peer can open two far-future rounds but not a third.
        for (n, round) in [5, 6, 7].into_iter().enumerate() {
            let mut vote = fx.signed_vote(0, VoteType::Prevote, block_id(b"b"));
            vote.round = round;
            vote.signature = Some(kp.sign(&vote.sign_bytes(CHAIN)));
            let result = hvs.add_vote(vote, Some(&peer));
            if n < MAX_PEER_CATCHUP_ROUNDS {
                assert!(result.unwrap());
            } else {
                assert!(matches!(result, Err(VoteSetError::UnwantedRound { .. })));
            }
        }
    }

    #[test]
    fn test_pol_info_finds_latest_majority() {
        let fx = fixture(4);
        let mut hvs = HeightVoteSet::new(CHAIN.into(), 1, fx.validators.clone(), false);
        let id = block_id(b"polka");

        for seat in 0..3 {
            hvs.add_vote(fx.signed_vote(seat, VoteType::Prevote, id.clone()), None)
                .unwrap();
        }
        assert_eq!(hvs.pol_info(), Some((0, id)));
    }
}
