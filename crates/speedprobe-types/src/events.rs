use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds delivered to listeners through `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum SpeedTestError {
    /// The URI could not be parsed.
    #[error("malformed uri")]
    MalformedUri,

    /// Scheme other than http, https or ftp (or an https upload redirect).
    #[error("unsupported protocol")]
    UnsupportedProtocol,

    /// Connect, DNS or mid-transfer socket failure.
    #[error("connection error")]
    ConnectionError,

    /// A connect, read or write exceeded the socket timeout.
    #[error("socket timeout")]
    SocketTimeout,

    /// Unexpected status code or unparseable response head.
    #[error("invalid http response")]
    InvalidHttpResponse,

    /// Missing or zero Content-Length / remote size.
    #[error("inconsistent content length")]
    InconsistentContentLength,

    /// The caller stopped the task; expected, not a network failure.
    #[error("socket force closed")]
    ForceCloseSocket,
}

impl SpeedTestError {
    /// True for the one kind that callers trigger themselves.
    pub fn is_force_close(self) -> bool {
        matches!(self, Self::ForceCloseSocket)
    }
}
