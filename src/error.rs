//! Error types shared across the proxy.

use std::io;

/// A CIDR literal could not be turned into an address range.
#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),
}

/// Failure of the outbound HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),
    #[error("unexpected status {0}")]
    Status(http::StatusCode),
    #[error("request timed out")]
    Timeout,
}

/// A range-database refresh did not produce a usable index.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("failed to fetch feed: {0}")]
    Fetch(#[from] FetchError),
    #[error("failed to read feed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed feed line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("feed produced no usable ranges")]
    Empty,
    #[error("refresh cancelled")]
    Cancelled,
}

/// Per-connection failure while serving a proxy request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("lookup {0}: no such host")]
    NoSuchHost(String),
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Errors that the client should see as `503 Service Unavailable`.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ProxyError::NoSuchHost(_) | ProxyError::Dial { .. }
        )
    }
}

/// A single resolver backend failed; the chain moves on to the next one.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable answer: {0}")]
    Decode(String),
}
