//! The consensus event bus.
//!
//! Observers (the reactor, RPC, tests) subscribe to snapshots of what the
//! state machine is doing. Publishing never blocks the driver; slow or
//! absent subscribers just miss events.

use tokio::sync::broadcast;
use tracing::trace;

use kestrel_types::Vote;

use crate::round_state::{CompleteProposalEvent, NewRoundEvent, RoundStateEvent};

/// Everything the consensus core announces to the outside.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// The state machine moved to a new step
    NewRoundStep(RoundStateEvent),
    /// A new round started
    NewRound(NewRoundEvent),
    /// The proposal block for the current round is fully assembled
    CompleteProposal(CompleteProposalEvent),
    /// A vote was accepted into a vote set
    Vote(Vote),
    /// A polka made a block the valid block
    ValidBlock(RoundStateEvent),
    /// The node locked on a block
    Lock(RoundStateEvent),
    /// The node re-locked on its locked block in a later round
    Relock(RoundStateEvent),
    /// A prevote two-thirds majority was observed
    Polka(RoundStateEvent),
    /// The propose timeout fired
    TimeoutPropose(RoundStateEvent),
    /// A prevote/precommit wait timeout fired
    TimeoutWait(RoundStateEvent),
}

/// Broadcast channel wrapper for consensus events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConsensusEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lack of subscribers is not an error.
    pub fn publish(&self, event: ConsensusEvent) {
        trace!(?event, "publishing consensus event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
