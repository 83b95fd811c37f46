//! Block proposals and proposer-based timestamp checks.

use kestrel_crypto::{PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::params::SynchronyParams;
use crate::vote::domains;
use crate::{Address, BlockId, Timestamp};

/// A proposer's signed offer of one block for `(height, round)`.
///
/// `pol_round` is −1 for a fresh proposal, or the round of the polka that
/// justifies re-proposing an earlier block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Block height
    pub height: u64,
    /// Round within the height
    pub round: i32,
    /// Proof-of-lock round: −1, or in `[0, round)`
    pub pol_round: i32,
    /// Id of the proposed block
    pub block_id: BlockId,
    /// Proposer-assigned timestamp, Unix milliseconds; must equal the
    /// block header time
    pub timestamp_ms: Timestamp,
    /// Address of the proposer
    pub proposer_address: Address,
    /// Signature over [`Proposal::sign_bytes`]
    pub signature: Option<Signature>,
}

impl Proposal {
    /// Create an unsigned proposal.
    pub fn new(
        height: u64,
        round: i32,
        pol_round: i32,
        block_id: BlockId,
        timestamp_ms: Timestamp,
        proposer_address: Address,
    ) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp_ms,
            proposer_address,
            signature: None,
        }
    }

    /// The canonical bytes the proposal signature covers.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(domains::PROPOSAL.len() + chain_id.len() + 96);
        bytes.extend_from_slice(domains::PROPOSAL);
        bytes.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
        bytes.extend_from_slice(chain_id.as_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.round.to_le_bytes());
        bytes.extend_from_slice(&self.pol_round.to_le_bytes());
        bytes.extend_from_slice(self.block_id.hash.as_bytes());
        bytes.extend_from_slice(&self.block_id.part_set_header.total.to_le_bytes());
        bytes.extend_from_slice(self.block_id.part_set_header.hash.as_bytes());
        bytes.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        bytes
    }

    /// Verify the proposal signature under the proposer's public key.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        match &self.signature {
            Some(sig) => pub_key.verify(&self.sign_bytes(chain_id), sig),
            None => false,
        }
    }

    /// Proposer-based timestamp check.
    ///
    /// A fresh proposal (pol_round = −1) is timely iff
    ///
    /// ```text
    /// timestamp − message_delay(round) ≤ receive_time ≤ timestamp + precision
    /// ```
    ///
    /// where `message_delay(r)` doubles each round, capped at `2^10`.
    pub fn is_timely(&self, receive_time_ms: Timestamp, sp: &SynchronyParams, round: i32) -> bool {
        let delay = sp.message_delay(round);
        let lower = self.timestamp_ms.saturating_sub(delay);
        let upper = self.timestamp_ms.saturating_add(sp.precision_ms);
        lower <= receive_time_ms && receive_time_ms <= upper
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proposal {}/{} (pol {}) {}",
            self.height,
            self.round,
            self.pol_round,
            self.block_id.hash.short(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PartSetHeader, H256};
    use kestrel_crypto::Keypair;

    fn sample_proposal(timestamp_ms: u64) -> Proposal {
        Proposal::new(
            5,
            0,
            -1,
            BlockId::new(H256::keccak256(b"block"), PartSetHeader::new(1, H256::NIL)),
            timestamp_ms,
            Address::new([4u8; 20]),
        )
    }

    fn sp() -> SynchronyParams {
        SynchronyParams {
            message_delay_ms: 500,
            precision_ms: 10,
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::from_seed(&[8u8; 32]);
        let mut proposal = sample_proposal(1000);
        proposal.signature = Some(keypair.sign(&proposal.sign_bytes("test-chain")));

        assert!(proposal.verify("test-chain", &keypair.public_key()));
        assert!(!proposal.verify("other-chain", &keypair.public_key()));
    }

    #[test]
    fn test_timely_window() {
        let proposal = sample_proposal(10_000);
        let sp = sp();

        // Receive exactly at the timestamp: timely.
        assert!(proposal.is_timely(10_000, &sp, 0));
        // The stamp may lead our clock by up to the delay bound.
        assert!(proposal.is_timely(9_500, &sp, 0));
        // One millisecond further ahead is untimely.
        assert!(!proposal.is_timely(9_499, &sp, 0));
        // Receive a little late relative to the stamp, within precision.
        assert!(proposal.is_timely(10_010, &sp, 0));
        assert!(!proposal.is_timely(10_011, &sp, 0));
    }

    #[test]
    fn test_message_delay_doubles_per_round() {
        let proposal = sample_proposal(10_000);
        let sp = sp();

        // Round 2: delay = 500 * 4 = 2000.
        assert!(proposal.is_timely(8_000, &sp, 2));
        assert!(!proposal.is_timely(7_999, &sp, 2));
    }
}
