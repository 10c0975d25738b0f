//! Error types for cryptographic operations

use thiserror::Error;

/// Errors that can occur on the overlay cipher path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Error during encryption
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Error during decryption (bad padding after the final block)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Ciphertext is not a whole number of cipher blocks
    #[error("Invalid ciphertext length: {0} is not a multiple of the block size")]
    InvalidLength(usize),
}
