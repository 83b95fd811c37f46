//! # Kestrel Crypto
//!
//! Cryptographic primitives for the Kestrel consensus engine.
//!
//! This crate provides:
//! - **Keccak256 hashing** - used for block hashes, part-set Merkle trees and
//!   address derivation
//! - **Ed25519 signatures** - validator signing keys for proposals and votes
//!
//! ## Example
//!
//! ```rust
//! use kestrel_crypto::{keccak256, Keypair};
//!
//! // Hash some data
//! let hash = keccak256(b"hello world");
//!
//! // Generate a signing key and sign
//! let keypair = Keypair::generate();
//! let signature = keypair.sign(b"message");
//!
//! // Verify the signature
//! assert!(keypair.public_key().verify(b"message", &signature));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod ed25519;
pub mod hash;

pub use ed25519::{Keypair, PublicKey, Signature};
pub use hash::{keccak256, keccak256_concat};

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Signature verification failed
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
