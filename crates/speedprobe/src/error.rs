use std::time::Duration;

use speedprobe_types::SpeedTestError;
use thiserror::Error;

use crate::ftp::FtpError;

/// Everything that can end a transfer run early.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed uri: {0}")]
    MalformedUri(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("socket timeout after {0:?}")]
    Timeout(Duration),

    /// Status 0 means the response head itself could not be parsed.
    #[error("invalid http response: {status} {reason}")]
    InvalidHttpResponse { status: u16, reason: String },

    #[error("inconsistent content length")]
    InconsistentContentLength,

    /// The run was cancelled from outside.
    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ftp error: {0}")]
    Ftp(#[from] FtpError),
}

impl TaskError {
    pub fn invalid_response(status: u16, reason: impl Into<String>) -> Self {
        Self::InvalidHttpResponse {
            status,
            reason: reason.into(),
        }
    }

    /// Listener-facing kind for this error.
    pub fn kind(&self) -> SpeedTestError {
        match self {
            Self::MalformedUri(_) => SpeedTestError::MalformedUri,
            Self::UnsupportedProtocol(_) => SpeedTestError::UnsupportedProtocol,
            Self::Connection(_) | Self::Closed => SpeedTestError::ConnectionError,
            Self::Timeout(_) => SpeedTestError::SocketTimeout,
            Self::InvalidHttpResponse { .. } => SpeedTestError::InvalidHttpResponse,
            Self::InconsistentContentLength => SpeedTestError::InconsistentContentLength,
            Self::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => SpeedTestError::SocketTimeout,
            Self::Io(_) => SpeedTestError::ConnectionError,
            Self::Ftp(FtpError::Timeout(_)) => SpeedTestError::SocketTimeout,
            Self::Ftp(_) => SpeedTestError::ConnectionError,
        }
    }

    /// After a force stop every failure of the run is reported as a force close.
    pub fn kind_for(&self, force_close: bool) -> SpeedTestError {
        if force_close {
            SpeedTestError::ForceCloseSocket
        } else {
            self.kind()
        }
    }
}
