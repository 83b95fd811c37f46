//! Error types for the Kestrel data model.

use thiserror::Error;

/// Errors produced while constructing or validating core types.
#[derive(Debug, Error)]
pub enum Error {
    /// A byte slice had the wrong length
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected number of bytes
        expected: usize,
        /// Actual number of bytes
        actual: usize,
    },

    /// A hash string could not be parsed
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// An address string could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Hex decoding failed
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// A block part failed Merkle proof verification
    #[error("part {index} failed proof verification against root {root}")]
    InvalidPartProof {
        /// Index of the offending part
        index: u32,
        /// Part-set root the proof was checked against
        root: crate::H256,
    },

    /// A block part carried an index outside the part set
    #[error("unexpected part index {index} (total {total})")]
    UnexpectedPartIndex {
        /// Index of the offending part
        index: u32,
        /// Number of parts in the set
        total: u32,
    },

    /// A reassembled block did not decode
    #[error("malformed block bytes: {0}")]
    MalformedBlock(String),

    /// A reassembled block hashed to something other than the block id
    #[error("block hash mismatch: expected {expected}, got {actual}")]
    BlockHashMismatch {
        /// Hash committed to by the block id
        expected: crate::H256,
        /// Hash of the reassembled block
        actual: crate::H256,
    },

    /// Evidence construction was structurally invalid
    #[error("invalid evidence: {0}")]
    InvalidEvidence(String),

    /// A commit could not be converted back into a vote set
    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for data-model operations.
pub type Result<T> = std::result::Result<T, Error>;
