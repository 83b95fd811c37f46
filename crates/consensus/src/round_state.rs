//! The per-height round state.
//!
//! [`RoundState`] is owned exclusively by the driver task; nothing else
//! mutates it. Observers get immutable [`RoundStateEvent`] snapshots
//! published after each step change.

use serde::{Deserialize, Serialize};

use kestrel_types::{
    Block, BlockId, PartSet, Proposal, Timestamp, ValidatorSet, H256,
};

use crate::vote_set::{HeightVoteSet, VoteSet};

/// The step the state machine is in within the current round.
///
/// Ordering matters: guards of the form "step not later than target" compare
/// steps directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Step {
    /// Waiting out the commit timeout before round 0 of the next height
    NewHeight,
    /// Round set up, waiting to propose (or for txs)
    NewRound,
    /// Waiting for the proposal and its block parts
    Propose,
    /// Prevote cast, collecting prevotes
    Prevote,
    /// Saw +2/3 prevotes for anything, waiting for a single majority
    PrevoteWait,
    /// Precommit cast, collecting precommits
    Precommit,
    /// Saw +2/3 precommits for anything, waiting for a single majority
    PrecommitWait,
    /// Saw +2/3 precommits for a block, finalizing
    Commit,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

/// All mutable consensus state for the height in progress.
///
/// Fields are public because the driver is the single writer; external
/// access goes through snapshot events only.
#[derive(Debug)]
pub struct RoundState {
    /// Height being decided
    pub height: u64,
    /// Current round
    pub round: i32,
    /// Current step
    pub step: Step,
    /// When round 0 of this height starts, Unix milliseconds
    pub start_time_ms: Timestamp,
    /// When the commit for this height was observed; 0 until then
    pub commit_time_ms: Timestamp,
    /// Validators for this height (proposer priorities advance per round)
    pub validators: ValidatorSet,
    /// The proposal received this round, if any
    pub proposal: Option<Proposal>,
    /// When the proposal arrived, for timeliness checks
    pub proposal_receive_time_ms: Timestamp,
    /// The reassembled proposal block, once all parts arrived
    pub proposal_block: Option<Block>,
    /// Accumulator for the proposal block's parts
    pub proposal_block_parts: Option<PartSet>,
    /// Round we locked in; −1 when not locked
    pub locked_round: i32,
    /// The locked block
    pub locked_block: Option<Block>,
    /// Parts of the locked block
    pub locked_block_parts: Option<PartSet>,
    /// Most recent round with a polka for a block; −1 if none
    pub valid_round: i32,
    /// The block that polka was for
    pub valid_block: Option<Block>,
    /// Parts of the valid block
    pub valid_block_parts: Option<PartSet>,
    /// Vote sets for every round of this height
    pub votes: HeightVoteSet,
    /// Round whose precommits committed the block; −1 until commit
    pub commit_round: i32,
    /// Precommits that justified the previous height
    pub last_commit: Option<VoteSet>,
    /// Validators that signed the previous height
    pub last_validators: ValidatorSet,
    /// Set once PrecommitWait has armed its timeout for this round
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    /// A zeroed round state, replaced on the first `update_to_state`.
    pub fn new(chain_id: &str) -> Self {
        let empty = ValidatorSet::new(Vec::new());
        Self {
            height: 0,
            round: 0,
            step: Step::NewHeight,
            start_time_ms: 0,
            commit_time_ms: 0,
            validators: empty.clone(),
            proposal: None,
            proposal_receive_time_ms: 0,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            valid_round: -1,
            valid_block: None,
            valid_block_parts: None,
            votes: HeightVoteSet::new(chain_id.to_string(), 0, empty.clone(), false),
            commit_round: -1,
            last_commit: None,
            last_validators: empty,
            triggered_timeout_precommit: false,
        }
    }

    /// Whether `block_hash` matches the locked block.
    pub fn locked_block_hashes_to(&self, hash: &H256) -> bool {
        self.locked_block
            .as_ref()
            .map(|b| b.hashes_to(hash))
            .unwrap_or(false)
    }

    /// Whether `block_hash` matches the proposal block.
    pub fn proposal_block_hashes_to(&self, hash: &H256) -> bool {
        self.proposal_block
            .as_ref()
            .map(|b| b.hashes_to(hash))
            .unwrap_or(false)
    }

    /// Deterministic snapshot of the fields observers care about.
    pub fn round_state_event(&self) -> RoundStateEvent {
        RoundStateEvent {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time_ms: self.start_time_ms,
            proposal_block_hash: self.proposal_block.as_ref().map(|b| b.hash()),
            locked_round: self.locked_round,
            locked_block_hash: self.locked_block.as_ref().map(|b| b.hash()),
            valid_round: self.valid_round,
            valid_block_hash: self.valid_block.as_ref().map(|b| b.hash()),
        }
    }

    /// Snapshot published when a new round starts.
    pub fn new_round_event(&self) -> NewRoundEvent {
        NewRoundEvent {
            height: self.height,
            round: self.round,
            proposer: self.validators.proposer().address,
        }
    }

    /// Snapshot published when the proposal block completes.
    pub fn complete_proposal_event(&self) -> CompleteProposalEvent {
        let block_id = match (&self.proposal_block, &self.proposal_block_parts) {
            (Some(block), Some(parts)) => BlockId::new(block.hash(), parts.header().clone()),
            _ => BlockId::nil(),
        };
        CompleteProposalEvent {
            height: self.height,
            round: self.round,
            block_id,
        }
    }
}

/// Snapshot of the round state, written to the WAL on each step change and
/// published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStateEvent {
    /// Height being decided
    pub height: u64,
    /// Current round
    pub round: i32,
    /// Current step
    pub step: Step,
    /// When round 0 of this height starts
    pub start_time_ms: Timestamp,
    /// Hash of the proposal block, if complete
    pub proposal_block_hash: Option<H256>,
    /// Locked round
    pub locked_round: i32,
    /// Hash of the locked block
    pub locked_block_hash: Option<H256>,
    /// Valid round
    pub valid_round: i32,
    /// Hash of the valid block
    pub valid_block_hash: Option<H256>,
}

/// Event published when a new round begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRoundEvent {
    /// Height being decided
    pub height: u64,
    /// The round just entered
    pub round: i32,
    /// Proposer for this round
    pub proposer: kestrel_types::Address,
}

/// Event published when the full proposal block has been received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteProposalEvent {
    /// Height being decided
    pub height: u64,
    /// Round of the proposal
    pub round: i32,
    /// Id of the completed block
    pub block_id: BlockId,
}
