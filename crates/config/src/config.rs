//! Node-local consensus configuration.
//!
//! Chain-wide parameters (timeouts, synchrony bounds, vote-extension
//! heights) live in the application-agreed consensus params; this module
//! holds the knobs an individual operator controls: WAL location, queue
//! sizes, empty-block policy, and the unsafe per-node timeout overrides.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Node-local consensus configuration, loaded from `kestrel.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Path to the consensus write-ahead log
    pub wal_file: PathBuf,

    /// How many recent commits to scan for our own signature before
    /// joining consensus; 0 disables the check
    pub double_sign_check_height: u64,

    /// Whether to propose blocks with no transactions
    pub create_empty_blocks: bool,

    /// How long to wait for transactions before proposing an empty block
    /// anyway, milliseconds; 0 waits indefinitely
    pub create_empty_blocks_interval_ms: u64,

    /// Capacity of the queue carrying messages from peers
    pub peer_queue_capacity: usize,

    /// Capacity of the queue carrying locally injected messages
    pub internal_queue_capacity: usize,

    /// Per-node override of the propose timeout, milliseconds; 0 defers
    /// to consensus params
    pub unsafe_propose_timeout_override_ms: u64,

    /// Per-node override of the propose timeout delta, milliseconds
    pub unsafe_propose_timeout_delta_override_ms: u64,

    /// Per-node override of the vote timeout, milliseconds
    pub unsafe_vote_timeout_override_ms: u64,

    /// Per-node override of the vote timeout delta, milliseconds
    pub unsafe_vote_timeout_delta_override_ms: u64,

    /// Per-node override of the commit timeout, milliseconds
    pub unsafe_commit_timeout_override_ms: u64,

    /// Per-node override of bypass-commit-timeout
    pub unsafe_bypass_commit_timeout_override: Option<bool>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            wal_file: PathBuf::from("./data/consensus.wal"),
            double_sign_check_height: 0,
            create_empty_blocks: true,
            create_empty_blocks_interval_ms: 0,
            peer_queue_capacity: 1000,
            internal_queue_capacity: 1000,
            unsafe_propose_timeout_override_ms: 0,
            unsafe_propose_timeout_delta_override_ms: 0,
            unsafe_vote_timeout_override_ms: 0,
            unsafe_vote_timeout_delta_override_ms: 0,
            unsafe_commit_timeout_override_ms: 0,
            unsafe_bypass_commit_timeout_override: None,
        }
    }
}

impl ConsensusConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!("loading consensus configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: ConsensusConfig = toml::from_str(&content)?;

        debug!("configuration parsed, validating");
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: ConsensusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.wal_file.as_os_str().is_empty() {
            return Err(ConfigError::EmptyWalFile);
        }
        if self.peer_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity {
                name: "peer_queue_capacity",
            });
        }
        if self.internal_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity {
                name: "internal_queue_capacity",
            });
        }
        if self.double_sign_check_height > 10_000 {
            return Err(ConfigError::DoubleSignCheckTooLarge(
                self.double_sign_check_height,
            ));
        }
        Ok(())
    }

    /// Whether round 0 should wait for transactions before proposing.
    pub fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || self.create_empty_blocks_interval_ms > 0
    }
}
