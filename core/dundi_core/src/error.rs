//! API-level errors returned to callers of the node handle

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::wire::WireError;

/// Errors surfaced by lookups, precaches, entity queries and start-up
#[derive(Debug)]
pub enum DundiError {
    /// No mapping is configured for the requested context
    NoMapping(String),
    /// An identical request from the same root is already in flight
    DuplicatePending,
    /// Worker queue is full
    OutOfThreads,
    /// The node is shutting down
    ShutDown,
    /// Invalid argument from the caller
    InvalidArgument(String),
    Io(io::Error),
    Config(ConfigError),
    Crypto(CryptoError),
    Wire(WireError),
}

impl fmt::Display for DundiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DundiError::NoMapping(ctx) => write!(f, "no mapping for context '{}'", ctx),
            DundiError::DuplicatePending => write!(f, "duplicate request pending"),
            DundiError::OutOfThreads => write!(f, "out of threads"),
            DundiError::ShutDown => write!(f, "node is shutting down"),
            DundiError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            DundiError::Io(e) => write!(f, "I/O error: {}", e),
            DundiError::Config(e) => write!(f, "configuration error: {}", e),
            DundiError::Crypto(e) => write!(f, "crypto error: {}", e),
            DundiError::Wire(e) => write!(f, "wire error: {}", e),
        }
    }
}

impl std::error::Error for DundiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DundiError::Io(e) => Some(e),
            DundiError::Config(e) => Some(e),
            DundiError::Crypto(e) => Some(e),
            DundiError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DundiError {
    fn from(e: io::Error) -> Self {
        DundiError::Io(e)
    }
}

impl From<ConfigError> for DundiError {
    fn from(e: ConfigError) -> Self {
        DundiError::Config(e)
    }
}

impl From<CryptoError> for DundiError {
    fn from(e: CryptoError) -> Self {
        DundiError::Crypto(e)
    }
}

impl From<WireError> for DundiError {
    fn from(e: WireError) -> Self {
        DundiError::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, DundiError>;
