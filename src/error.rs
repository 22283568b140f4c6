//! Error types for the pivot bridge

use std::io;
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Caller-supplied argument was rejected (empty name, zero size,
    /// overflowing size computation)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Named resource does not exist (engine binary, shared memory segment)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The OS could not create or map a shared memory segment
    #[error("Failed to allocate shared memory '{name}': {source}")]
    AllocationFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The engine process could not be launched
    #[error("Failed to spawn engine '{path}': {source}")]
    SpawnFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A channel operation was attempted without a running engine
    #[error("Engine process not started or has terminated")]
    NotRunning,

    /// Writing a command line to the engine's stdin failed
    #[error("Failed writing to engine stdin: {0}")]
    WriteFailed(#[source] io::Error),

    /// Reading a response line from the engine's stdout failed or the
    /// stream ended before a matching line arrived
    #[error("Failed reading from engine stdout: {0}")]
    ReadFailed(#[source] io::Error),
}
