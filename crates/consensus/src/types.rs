//! Messages flowing into the driver.

use serde::{Deserialize, Serialize};

use kestrel_types::{Part, Proposal, Timestamp, Vote};

/// Identifier of the peer a message came from.
pub type PeerId = String;

/// A consensus message: proposal, block part, or vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A proposal for the current height and round
    Proposal(Proposal),
    /// One part of a proposal block
    BlockPart {
        /// Height the part belongs to
        height: u64,
        /// Round the part was produced in
        round: i32,
        /// The part itself
        part: Part,
    },
    /// A prevote or precommit
    Vote(Vote),
}

/// A message plus its provenance. `peer_id` is `None` for self-authored
/// messages, which get the stricter WAL durability treatment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgInfo {
    /// The message
    pub msg: Message,
    /// Originating peer; `None` when self-authored
    pub peer_id: Option<PeerId>,
    /// When the message was received, Unix milliseconds
    pub receive_time_ms: Timestamp,
}

impl MsgInfo {
    /// Whether this message originated locally.
    pub fn is_internal(&self) -> bool {
        self.peer_id.is_none()
    }
}
