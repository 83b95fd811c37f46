//! # Kestrel Consensus
//!
//! The single-height, multi-round BFT consensus core of Kestrel.
//!
//! A deterministic driver owns the round state and, given a stream of
//! network messages (proposals, block parts, votes) and local timeouts,
//! decides one block per height and commits it atomically.
//!
//! ## Round structure
//!
//! ```text
//! ┌───────────┐
//! │ NewHeight │◄──────────────────────────────────────────────┐
//! └─────┬─────┘                                               │
//!       ▼                                                     │
//! ┌───────────┐   txs / proof block / interval                │
//! │ NewRound  │──────────────────────────┐                    │
//! └───────────┘                          ▼                    │
//!       ▲                          ┌──────────┐               │
//!       │ +2/3 precommits          │ Propose  │               │
//!       │ at a later round         └────┬─────┘               │
//!       │                               ▼                     │
//! ┌─────┴─────────┐   timeout     ┌──────────┐                │
//! │ PrecommitWait │◄───────────── │ Prevote  │─► PrevoteWait  │
//! └─────┬─────────┘               └──────────┘       │        │
//!       │                               ▲            ▼        │
//!       │                               │      ┌───────────┐  │
//!       │ +2/3 precommits for a block   └──────│ Precommit │  │
//!       ▼                                      └───────────┘  │
//! ┌───────────┐  save block, fsync end-height, apply          │
//! │  Commit   │───────────────────────────────────────────────┘
//! └───────────┘
//! ```
//!
//! ## Safety
//!
//! - **Locking**: once +2/3 prevote a block we precommit and lock it; we
//!   only prevote a different block after a later polka.
//! - **Equivocation barrier**: every self-authored vote and proposal is
//!   fsynced to the write-ahead log before its signature leaves the
//!   signer, and WAL replay never re-signs.
//! - **One block per height**: the commit round's precommit set must hold
//!   more than two thirds of the voting power for one block id.
//!
//! External collaborators (the application, the stores, the signer, the
//! mempool and the evidence pool) are consumed through the capability
//! interfaces in [`traits`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod driver;
pub mod events;
pub mod round_state;
pub mod timeout;
pub mod traits;
pub mod types;
pub mod vote_set;
pub mod wal;

// Re-export main types at crate root for convenience
pub use driver::{ConsensusHandle, Driver, DriverError};
pub use events::{ConsensusEvent, EventBus};
pub use round_state::{
    CompleteProposalEvent, NewRoundEvent, RoundState, RoundStateEvent, Step,
};
pub use timeout::{TimeoutInfo, TimeoutTicker};
pub use traits::{
    BlockExecutor, BlockStore, EvidencePool, ExecutorError, PrivValidator, SignerError,
    StateStore, StoreError, TxKey, TxNotifier,
};
pub use types::{Message, MsgInfo, PeerId};
pub use vote_set::{ConflictingVotes, HeightVoteSet, VoteSet, VoteSetError};
pub use wal::{Wal, WalError, WalMessage, WalReader, WalResult};
