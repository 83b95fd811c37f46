//! # Kestrel Configuration
//!
//! Node-local configuration for the Kestrel consensus engine.
//!
//! Kestrel separates two kinds of settings:
//!
//! - **Consensus params** are chain-wide, agreed through the application
//!   state, and live in `kestrel-types`.
//! - **[`ConsensusConfig`]** is node-local: where the WAL lives, queue
//!   capacities, the empty-block policy, and per-node unsafe overrides.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kestrel_config::ConsensusConfig;
//! use std::path::Path;
//!
//! let config = ConsensusConfig::load(Path::new("kestrel.toml"))?;
//! println!("WAL at {:?}", config.wal_file);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;

pub use config::ConsensusConfig;
pub use error::{ConfigError, ConfigResult};
