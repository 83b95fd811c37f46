//! Contracts consumed by the consensus core.
//!
//! The driver never talks to the application, the stores, the mempool, the
//! evidence machinery or the signing key directly; everything external
//! enters through these capability interfaces.

use async_trait::async_trait;
use thiserror::Error;

use kestrel_crypto::PublicKey;
use kestrel_types::{
    Block, BlockId, BlockMeta, Commit, ExtendedCommit, PartSet, Proposal, State, Vote, H256,
};

/// Key identifying a transaction in the mempool.
pub type TxKey = H256;

/// Errors from the block executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The block failed consensus-level validation
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// The application failed while processing
    #[error("application error: {0}")]
    Application(String),
}

/// Errors from the external signer.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The signer declined to sign (e.g. its own double-sign guard fired)
    #[error("signer refused: {0}")]
    Refused(String),

    /// The signer did not answer before the deadline
    #[error("signer timed out")]
    Timeout,

    /// Transport or hardware failure
    #[error("signer error: {0}")]
    Other(String),
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not produce a usable state
    #[error("state store error: {0}")]
    Load(String),
}

/// Creates, validates and applies blocks against the application.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    /// Build a proposal block on top of `state`.
    async fn create_proposal_block(
        &self,
        height: u64,
        state: &State,
        last_extended_commit: &ExtendedCommit,
        proposer: kestrel_types::Address,
    ) -> Result<Block, ExecutorError>;

    /// Consensus-level block validation.
    async fn validate_block(&self, state: &State, block: &Block) -> Result<(), ExecutorError>;

    /// Ask the application whether it accepts the proposed block.
    async fn process_proposal(&self, block: &Block, state: &State)
        -> Result<bool, ExecutorError>;

    /// Execute the committed block, returning the new chain state.
    async fn apply_block(
        &self,
        state: State,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<State, ExecutorError>;

    /// Ask the application for the extension to attach to `vote`.
    async fn extend_vote(&self, vote: &Vote) -> Result<Vec<u8>, ExecutorError>;

    /// Ask the application to validate a peer's vote extension.
    async fn verify_vote_extension(&self, vote: &Vote) -> Result<(), ExecutorError>;

    /// Resolve transactions by key, returning the ones found and the keys
    /// that are missing from the mempool.
    async fn safe_get_txs_by_keys(&self, keys: &[TxKey]) -> (Vec<Vec<u8>>, Vec<TxKey>);
}

/// Persistent storage for blocks, parts and commits.
pub trait BlockStore: Send + Sync {
    /// Height of the highest stored block; 0 when empty.
    fn height(&self) -> u64;

    /// Persist a decided block with the commit we witnessed for it.
    fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit);

    /// Persist a decided block with its extended commit (vote extensions
    /// enabled at this height).
    fn save_block_with_extended_commit(
        &self,
        block: &Block,
        parts: &PartSet,
        seen_commit: &ExtendedCommit,
    );

    /// The canonical commit for `height` (as embedded in the next block).
    fn load_block_commit(&self, height: u64) -> Option<Commit>;

    /// The locally witnessed commit for the highest stored block.
    fn load_seen_commit(&self) -> Option<Commit>;

    /// The extended commit for `height`, when stored.
    fn load_block_extended_commit(&self, height: u64) -> Option<ExtendedCommit>;

    /// Header and id of the block at `height`.
    fn load_block_meta(&self, height: u64) -> Option<BlockMeta>;
}

/// Source of the chain state consensus starts from.
pub trait StateStore: Send + Sync {
    /// Load the current chain state.
    fn load(&self) -> Result<State, StoreError>;
}

/// The external signer holding the validator key.
#[async_trait]
pub trait PrivValidator: Send + Sync {
    /// The public key of the signing identity. Keys may rotate between
    /// heights, so this is re-fetched after every commit.
    async fn get_pub_key(&self) -> Result<PublicKey, SignerError>;

    /// Sign `vote`, filling in its signature fields.
    async fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError>;

    /// Sign `proposal`, filling in its signature field.
    async fn sign_proposal(
        &self,
        chain_id: &str,
        proposal: &mut Proposal,
    ) -> Result<(), SignerError>;
}

/// Mempool signal that transactions are waiting.
#[async_trait]
pub trait TxNotifier: Send + Sync {
    /// Resolves when the mempool has transactions available. Only consulted
    /// while waiting to enter round 0's propose step.
    async fn txs_available(&self);
}

/// Sink for conflicting-vote pairs observed by the driver.
pub trait EvidencePool: Send + Sync {
    /// Record two conflicting votes from the same validator.
    fn report_conflicting_votes(&self, vote_a: &Vote, vote_b: &Vote);
}
