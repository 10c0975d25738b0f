//! Store error types

use std::fmt;

/// Storage layer errors
#[derive(Debug)]
pub enum StoreError {
    /// Configuration file could not be parsed
    Parse(String),
    /// Configuration value rejected
    Invalid(String),
    /// IO error
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Config parse error: {}", msg),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
