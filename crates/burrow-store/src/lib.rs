//! Persistent configuration layer for Burrow
//!
//! Owns the `config.json` schema (network identity, forwarding apps, log
//! level), its load/save cycle, and the derived defaults: hostname-based
//! node names and the deterministic TCP port hash.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;

pub use config::{AppConfig, Config, ConfigStore, NetworkConfig, Protocol};
pub use error::StoreError;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
