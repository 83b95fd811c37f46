//! Vote messages and their signing discipline.
//!
//! A [`Vote`] is a prevote or precommit for one `(height, round)` position.
//! Sign bytes are domain-separated so a prevote signature can never be
//! replayed as a precommit, a proposal, or a vote on another chain.

use kestrel_crypto::{PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::{Address, BlockId, Timestamp};

/// Domain separators for signature security.
///
/// These prefixes prevent signature replay across contexts: a signature over
/// a prevote cannot be reused as a precommit or a proposal signature.
pub mod domains {
    /// Domain separator for block proposals
    pub const PROPOSAL: &[u8] = b"KESTREL_PROPOSAL_V1";
    /// Domain separator for prevote messages
    pub const PREVOTE: &[u8] = b"KESTREL_PREVOTE_V1";
    /// Domain separator for precommit messages
    pub const PRECOMMIT: &[u8] = b"KESTREL_PRECOMMIT_V1";
    /// Domain separator for vote extensions
    pub const VOTE_EXTENSION: &[u8] = b"KESTREL_VOTE_EXTENSION_V1";
}

/// Vote type: the two voting phases of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// First voting phase, cast after observing (or timing out on) a proposal
    Prevote,
    /// Second voting phase, cast after observing a polka
    Precommit,
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "Prevote"),
            VoteType::Precommit => write!(f, "Precommit"),
        }
    }
}

/// A single validator's vote at one `(height, round, type)` position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Prevote or precommit
    pub vote_type: VoteType,
    /// Block height
    pub height: u64,
    /// Round within the height
    pub round: i32,
    /// Block voted for; nil block id for a nil vote
    pub block_id: BlockId,
    /// Wall-clock time at signing, Unix milliseconds
    pub timestamp_ms: Timestamp,
    /// Address of the voting validator
    pub validator_address: Address,
    /// Index of the validator in the active set
    pub validator_index: u32,
    /// Signature over [`Vote::sign_bytes`]
    pub signature: Option<Signature>,
    /// Application-supplied extension; only on non-nil precommits when
    /// extensions are enabled at this height
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<u8>,
    /// Signature over [`Vote::extension_sign_bytes`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_signature: Option<Signature>,
}

impl Vote {
    /// Create an unsigned vote.
    pub fn new(
        vote_type: VoteType,
        height: u64,
        round: i32,
        block_id: BlockId,
        timestamp_ms: Timestamp,
        validator_address: Address,
        validator_index: u32,
    ) -> Self {
        Self {
            vote_type,
            height,
            round,
            block_id,
            timestamp_ms,
            validator_address,
            validator_index,
            signature: None,
            extension: Vec::new(),
            extension_signature: None,
        }
    }

    /// Whether this vote is for "no block".
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }

    /// The canonical bytes the vote signature covers.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let domain = match self.vote_type {
            VoteType::Prevote => domains::PREVOTE,
            VoteType::Precommit => domains::PRECOMMIT,
        };
        let mut bytes = Vec::with_capacity(domain.len() + chain_id.len() + 96);
        bytes.extend_from_slice(domain);
        bytes.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
        bytes.extend_from_slice(chain_id.as_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.round.to_le_bytes());
        bytes.extend_from_slice(self.block_id.hash.as_bytes());
        bytes.extend_from_slice(&self.block_id.part_set_header.total.to_le_bytes());
        bytes.extend_from_slice(self.block_id.part_set_header.hash.as_bytes());
        bytes.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        bytes
    }

    /// The canonical bytes the extension signature covers.
    pub fn extension_sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(domains::VOTE_EXTENSION.len() + chain_id.len() + 16 + self.extension.len());
        bytes.extend_from_slice(domains::VOTE_EXTENSION);
        bytes.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
        bytes.extend_from_slice(chain_id.as_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.round.to_le_bytes());
        bytes.extend_from_slice(&self.extension);
        bytes
    }

    /// Verify the vote signature under the validator's public key.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        match &self.signature {
            Some(sig) => pub_key.verify(&self.sign_bytes(chain_id), sig),
            None => false,
        }
    }

    /// Verify the extension signature under the validator's public key.
    ///
    /// A vote without extension data or without an extension signature
    /// fails verification.
    pub fn verify_extension(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        match &self.extension_signature {
            Some(sig) => pub_key.verify(&self.extension_sign_bytes(chain_id), sig),
            None => false,
        }
    }

    /// Remove any extension data. Returns true if something was stripped.
    ///
    /// Used when vote extensions are disabled at the current height but a
    /// peer (or the signer) attached extension fields anyway.
    pub fn strip_extension(&mut self) -> bool {
        let stripped = !self.extension.is_empty() || self.extension_signature.is_some();
        self.extension.clear();
        self.extension_signature = None;
        stripped
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{} {} by {}",
            self.vote_type,
            self.height,
            self.round,
            self.block_id.hash.short(),
            self.validator_address,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartSetHeader;
    use crate::H256;
    use kestrel_crypto::Keypair;

    fn sample_vote(vote_type: VoteType, hash: H256) -> Vote {
        Vote::new(
            vote_type,
            10,
            2,
            BlockId::new(hash, PartSetHeader::new(4, H256::keccak256(b"parts"))),
            1_700_000_000_000,
            Address::new([9u8; 20]),
            3,
        )
    }

    #[test]
    fn test_sign_bytes_differ_by_type() {
        let hash = H256::keccak256(b"block");
        let prevote = sample_vote(VoteType::Prevote, hash);
        let precommit = sample_vote(VoteType::Precommit, hash);
        assert_ne!(prevote.sign_bytes("test-chain"), precommit.sign_bytes("test-chain"));
    }

    #[test]
    fn test_sign_bytes_differ_by_chain() {
        let vote = sample_vote(VoteType::Prevote, H256::keccak256(b"block"));
        assert_ne!(vote.sign_bytes("chain-a"), vote.sign_bytes("chain-b"));
    }

    #[test]
    fn test_verify_signed_vote() {
        let keypair = Keypair::from_seed(&[1u8; 32]);
        let mut vote = sample_vote(VoteType::Precommit, H256::keccak256(b"block"));
        vote.signature = Some(keypair.sign(&vote.sign_bytes("test-chain")));

        assert!(vote.verify("test-chain", &keypair.public_key()));
        assert!(!vote.verify("other-chain", &keypair.public_key()));
    }

    #[test]
    fn test_extension_verify_and_strip() {
        let keypair = Keypair::from_seed(&[2u8; 32]);
        let mut vote = sample_vote(VoteType::Precommit, H256::keccak256(b"block"));
        vote.extension = b"app data".to_vec();
        vote.extension_signature =
            Some(keypair.sign(&vote.extension_sign_bytes("test-chain")));

        assert!(vote.verify_extension("test-chain", &keypair.public_key()));

        assert!(vote.strip_extension());
        assert!(vote.extension.is_empty());
        assert!(vote.extension_signature.is_none());
        assert!(!vote.strip_extension());
    }

    #[test]
    fn test_nil_vote() {
        let vote = sample_vote(VoteType::Prevote, H256::NIL);
        // A nil hash with a non-nil part set header is still not a nil vote.
        assert!(!vote.is_nil());

        let nil = Vote::new(
            VoteType::Prevote,
            10,
            0,
            BlockId::nil(),
            0,
            Address::new([1u8; 20]),
            0,
        );
        assert!(nil.is_nil());
    }
}
