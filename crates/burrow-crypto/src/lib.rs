//! Cryptographic primitives for the Burrow overlay data path
//!
//! A single cipher suite: AES-128-CBC with PKCS#7 padding and a fixed IV.
//! The IV and padding are wire-compatible with every deployed peer, so they
//! must never change. Overlay confidentiality relies on the per-app key,
//! not on this construction being state of the art.

#![forbid(unsafe_code)]

pub mod error;
pub mod overlay;

pub use error::CryptoError;
pub use overlay::{decrypt_overlay, encrypt_overlay, OverlayKey, AES_KEY_SIZE, BLOCK_SIZE};

/// Result type alias using CryptoError
pub type Result<T> = std::result::Result<T, CryptoError>;
