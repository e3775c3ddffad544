//! Error types for SlyMesh.
//!
//! Library code returns [`Result`], whose error enum follows the failure
//! taxonomy of the sync engine:
//!
//! - [`Error::Protocol`] - malformed frame or a message the connection state does not allow
//! - [`Error::Authentication`] - bad signature, nonce mismatch or the wrong peer
//! - [`Error::Trust`] - valid signature from a signer we do not trust
//! - [`Error::TransferStall`] - no bytes arrived within the stall window
//! - [`Error::LogInconsistency`] - event references an unknown parent or item
//! - [`Error::Storage`] - blob store or disk failure
//!
//! The CLI and configuration layers wrap these in `anyhow`.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for SlyMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SlyMesh operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed frame or unexpected message; the connection is closed without retry
    #[error("protocol violation: {0}")]
    Protocol(Arc<str>),

    /// Peer failed to prove its identity
    #[error("authentication failed: {0}")]
    Authentication(Arc<str>),

    /// Signature is valid but the signer is not trusted
    #[error("untrusted signer: {0}")]
    Trust(Arc<str>),

    /// Download made no progress within the stall timeout
    #[error("transfer stalled: {0}")]
    TransferStall(Arc<str>),

    /// Event log refers to something that has not been replayed
    #[error("log inconsistency: {0}")]
    LogInconsistency(Arc<str>),

    /// Blob store or local disk failure
    #[error("storage error: {0}")]
    Storage(Arc<str>),

    /// A record or identifier could not be parsed
    #[error("malformed data: {0}")]
    Malformed(Arc<str>),

    /// Configuration problem
    #[error("configuration error: {0}")]
    Config(Arc<str>),

    /// Underlying I/O error
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// The component has been shut down
    #[error("shut down")]
    Shutdown,
}

impl Error {
    #[inline]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(Arc::from(msg.into()))
    }

    #[inline]
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(Arc::from(msg.into()))
    }

    #[inline]
    pub fn trust(msg: impl Into<String>) -> Self {
        Self::Trust(Arc::from(msg.into()))
    }

    #[inline]
    pub fn stall(msg: impl Into<String>) -> Self {
        Self::TransferStall(Arc::from(msg.into()))
    }

    #[inline]
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::LogInconsistency(Arc::from(msg.into()))
    }

    #[inline]
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(Arc::from(msg.into()))
    }

    #[inline]
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(Arc::from(msg.into()))
    }

    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(Arc::from(msg.into()))
    }

    /// Whether a connection failing with this error should be retried
    /// according to its reconnect policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Authentication(_) | Error::Io(_) | Error::TransferStall(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::malformed(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::malformed(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::malformed(err.to_string())
    }
}
