//! Chain state as seen by consensus.
//!
//! [`State`] is the digest of everything consensus needs from the
//! application side to run one height: the validator sets, the last block,
//! and the consensus parameters. It is loaded from the state store at boot
//! and replaced by `BlockExecutor::apply_block` after every commit.

use serde::{Deserialize, Serialize};

use crate::{
    Address, Block, BlockId, Commit, ConsensusParams, Evidence, Header, Timestamp, ValidatorSet,
    H256,
};

/// Chain state up to (and including) `last_block_height`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Chain identifier
    pub chain_id: String,
    /// First height of this chain (genesis height)
    pub initial_height: u64,
    /// Height of the last committed block; 0 before the first commit
    pub last_block_height: u64,
    /// Id of the last committed block
    pub last_block_id: BlockId,
    /// Time of the last committed block, Unix milliseconds
    pub last_block_time_ms: Timestamp,
    /// Validators for height `last_block_height + 1`
    pub validators: ValidatorSet,
    /// Validators that signed the last commit
    pub last_validators: ValidatorSet,
    /// Application hash after the last block
    pub app_hash: H256,
    /// Chain-wide consensus parameters
    pub consensus_params: ConsensusParams,
}

impl State {
    /// Whether this state carries no validators (an unbootstrapped store).
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The next height consensus should run.
    pub fn next_height(&self) -> u64 {
        if self.last_block_height == 0 {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// Assemble a block on top of this state.
    pub fn make_block(
        &self,
        height: u64,
        time_ms: Timestamp,
        data: Vec<Vec<u8>>,
        evidence: Vec<Evidence>,
        last_commit: Commit,
        proposer_address: Address,
    ) -> Block {
        let header = Header {
            chain_id: self.chain_id.clone(),
            height,
            time_ms,
            last_block_id: self.last_block_id.clone(),
            last_commit_hash: H256::NIL,
            data_hash: H256::NIL,
            validators_hash: self.validators.hash(),
            app_hash: self.app_hash,
            evidence_hash: H256::NIL,
            proposer_address,
        };
        Block::new(header, data, evidence, last_commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Validator;
    use kestrel_crypto::Keypair;

    fn sample_state() -> State {
        let vals = ValidatorSet::new(vec![Validator::new(
            Keypair::from_seed(&[1u8; 32]).public_key(),
            10,
        )]);
        State {
            chain_id: "test-chain".to_string(),
            initial_height: 1,
            last_block_height: 0,
            last_block_id: BlockId::nil(),
            last_block_time_ms: 0,
            validators: vals.clone(),
            last_validators: vals,
            app_hash: H256::NIL,
            consensus_params: ConsensusParams::default(),
        }
    }

    #[test]
    fn test_next_height_before_and_after_first_commit() {
        let mut state = sample_state();
        assert_eq!(state.next_height(), 1);

        state.last_block_height = 7;
        assert_eq!(state.next_height(), 8);
    }

    #[test]
    fn test_make_block_carries_state() {
        let state = sample_state();
        let proposer = state.validators.validators[0].address;
        let block = state.make_block(1, 42, vec![b"tx".to_vec()], vec![], Commit::empty(), proposer);

        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.chain_id, "test-chain");
        assert_eq!(block.header.validators_hash, state.validators.hash());
        assert_eq!(block.header.proposer_address, proposer);
    }
}
