//! Consensus parameters.
//!
//! These are chain-wide parameters agreed through the application state, as
//! opposed to node-local configuration. Durations are Unix milliseconds so
//! they serialize unambiguously.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chain-wide consensus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsensusParams {
    /// Block limits
    #[serde(default)]
    pub block: BlockParams,
    /// Evidence limits
    #[serde(default)]
    pub evidence: EvidenceParams,
    /// Validator key requirements
    #[serde(default)]
    pub validator: ValidatorParams,
    /// Application version
    #[serde(default)]
    pub version: VersionParams,
    /// Proposer-based timestamp bounds
    #[serde(default)]
    pub synchrony: SynchronyParams,
    /// Consensus timeouts
    #[serde(default)]
    pub timeout: TimeoutParams,
    /// Application (ABCI) parameters
    #[serde(default)]
    pub abci: AbciParams,
}

impl ConsensusParams {
    /// Whether vote extensions are required at `height`.
    pub fn vote_extensions_enabled(&self, height: u64) -> bool {
        self.abci.vote_extensions_enable_height > 0
            && height >= self.abci.vote_extensions_enable_height
    }
}

/// Block limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    /// Maximum encoded block size in bytes
    pub max_bytes: u64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 21 * 1024 * 1024,
        }
    }
}

/// Evidence limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    /// Maximum evidence age in blocks
    pub max_age_num_blocks: u64,
    /// Maximum evidence age in milliseconds
    pub max_age_duration_ms: u64,
    /// Maximum total evidence bytes per block
    pub max_bytes: u64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 100_000,
            max_age_duration_ms: 48 * 60 * 60 * 1000,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Validator key requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorParams {
    /// Accepted public key types
    pub pub_key_types: Vec<String>,
}

impl Default for ValidatorParams {
    fn default() -> Self {
        Self {
            pub_key_types: vec!["ed25519".to_string()],
        }
    }
}

/// Application version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VersionParams {
    /// Application protocol version
    pub app_version: u64,
}

/// Proposer-based timestamp bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronyParams {
    /// Base bound on message delivery delay, milliseconds
    pub message_delay_ms: u64,
    /// Bound on clock drift between validators, milliseconds
    pub precision_ms: u64,
}

impl Default for SynchronyParams {
    fn default() -> Self {
        Self {
            message_delay_ms: 500,
            precision_ms: 505,
        }
    }
}

impl SynchronyParams {
    /// The delivery-delay bound at `round`: the base delay doubled each
    /// round, capped at `2^10` times the base.
    pub fn message_delay(&self, round: i32) -> u64 {
        let exp = round.clamp(0, 10) as u32;
        self.message_delay_ms.saturating_mul(1u64 << exp)
    }
}

/// Consensus timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutParams {
    /// Base wait for a proposal, milliseconds
    pub propose_ms: u64,
    /// Per-round increase of the propose timeout, milliseconds
    pub propose_delta_ms: u64,
    /// Base wait in PrevoteWait/PrecommitWait, milliseconds
    pub vote_ms: u64,
    /// Per-round increase of the vote timeout, milliseconds
    pub vote_delta_ms: u64,
    /// Wait between commit and the next height's round 0, milliseconds
    pub commit_ms: u64,
    /// Skip the commit timeout once all precommits are in
    pub bypass_commit_timeout: bool,
}

impl Default for TimeoutParams {
    fn default() -> Self {
        Self {
            propose_ms: 3_000,
            propose_delta_ms: 500,
            vote_ms: 1_000,
            vote_delta_ms: 500,
            commit_ms: 1_000,
            bypass_commit_timeout: false,
        }
    }
}

impl TimeoutParams {
    /// Propose timeout at `round`.
    pub fn propose(&self, round: i32) -> Duration {
        Duration::from_millis(
            self.propose_ms
                .saturating_add(self.propose_delta_ms.saturating_mul(round.max(0) as u64)),
        )
    }

    /// Vote timeout at `round`.
    pub fn vote(&self, round: i32) -> Duration {
        Duration::from_millis(
            self.vote_ms
                .saturating_add(self.vote_delta_ms.saturating_mul(round.max(0) as u64)),
        )
    }

    /// Commit timeout.
    pub fn commit(&self) -> Duration {
        Duration::from_millis(self.commit_ms)
    }
}

/// Application (ABCI) parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AbciParams {
    /// First height at which vote extensions are required; 0 disables them
    pub vote_extensions_enable_height: u64,
    /// Whether the mempool rechecks transactions after each block
    pub recheck_tx: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_extensions_enable_height() {
        let mut params = ConsensusParams::default();
        assert!(!params.vote_extensions_enabled(1));

        params.abci.vote_extensions_enable_height = 10;
        assert!(!params.vote_extensions_enabled(9));
        assert!(params.vote_extensions_enabled(10));
        assert!(params.vote_extensions_enabled(11));
    }

    #[test]
    fn test_timeouts_grow_linearly() {
        let t = TimeoutParams::default();
        assert_eq!(t.propose(0), Duration::from_millis(3_000));
        assert_eq!(t.propose(2), Duration::from_millis(4_000));
        assert_eq!(t.vote(0), Duration::from_millis(1_000));
        assert_eq!(t.vote(3), Duration::from_millis(2_500));
    }

    #[test]
    fn test_message_delay_caps() {
        let sp = SynchronyParams {
            message_delay_ms: 100,
            precision_ms: 0,
        };
        assert_eq!(sp.message_delay(0), 100);
        assert_eq!(sp.message_delay(1), 200);
        assert_eq!(sp.message_delay(10), 100 * 1024);
        assert_eq!(sp.message_delay(11), 100 * 1024);
    }

    #[test]
    fn test_params_toml_compatible() {
        let params = ConsensusParams::default();
        let json = serde_json::to_string(&params).unwrap();
        let back: ConsensusParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }
}
