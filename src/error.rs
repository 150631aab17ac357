//! Error types for binder-dns.

use thiserror::Error;

/// Errors that can occur in the DNS server.
#[derive(Debug, Error)]
pub enum BinderError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory client error
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// HTTP client error (resolver backend)
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// JSON decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// An upstream exchange did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The recursion backend could not be located or queried
    #[error("Resolver backend unavailable: {0}")]
    Backend(String),
}

/// Errors raised by a [`Directory`](crate::directory::Directory) implementation.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The session with the coordination store was lost
    #[error("directory session lost")]
    SessionLost,

    /// Any other failure reported by the backing client
    #[error("directory backend error: {0}")]
    Backend(String),
}

/// A node payload that is not JSON.
#[derive(Debug, Error)]
#[error("malformed record payload: {0}")]
pub struct RecordError(#[from] serde_json::Error);
