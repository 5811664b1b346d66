/// Structured lifecycle logging for transfer runs.
///
/// The task emits one `TransferLog` per lifecycle event. The default sink
/// writes to `tracing`; callers can swap in their own or silence it.

use std::fmt;

use speedprobe_types::SpeedTestMode;
use uuid::Uuid;

/// Structured log entry for one run.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub run_id: Uuid,
    pub event: TransferEvent,
}

/// Events a run can log.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Opening a connection
    Connecting {
        mode: SpeedTestMode,
        uri: String,
    },
    /// Socket (or FTP data channel) ready
    Connected {
        addr: String,
    },
    /// Following a 301/302/307
    Redirect {
        status: u16,
        location: String,
        hop: u32,
    },
    /// One read or write finished
    ChunkTransferred {
        size: usize,
        total: u64,
    },
    /// Run finished normally
    Completed {
        bytes: u64,
        duration_ms: u64,
        rate_octet: f64,
    },
    /// Run failed
    Error {
        message: String,
    },
    /// Caller requested a force stop
    ForceStop,
    /// Repeat: one sub-request completed
    RepeatRunCompleted {
        request_num: u32,
        rate_octet: f64,
    },
    /// Repeat: window timer fired
    RepeatWindowClosed {
        request_num: u32,
        window_ms: u64,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { mode, uri } => write!(f, "connecting mode={} uri={}", mode, uri),
            Self::Connected { addr } => write!(f, "connected addr={}", addr),
            Self::Redirect { status, location, hop } => {
                write!(f, "redirect status={} location={} hop={}", status, location, hop)
            }
            Self::ChunkTransferred { size, total } => {
                write!(f, "chunk size={} total={}", size, total)
            }
            Self::Completed { bytes, duration_ms, rate_octet } => {
                write!(f, "completed bytes={} duration_ms={} rate={:.1}B/s", bytes, duration_ms, rate_octet)
            }
            Self::Error { message } => write!(f, "error: {}", message),
            Self::ForceStop => f.write_str("force_stop"),
            Self::RepeatRunCompleted { request_num, rate_octet } => {
                write!(f, "repeat_run_completed n={} rate={:.1}B/s", request_num, rate_octet)
            }
            Self::RepeatWindowClosed { request_num, window_ms } => {
                write!(f, "repeat_window_closed n={} window_ms={}", request_num, window_ms)
            }
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::ChunkTransferred { .. } => {
                tracing::debug!(component = entry.component, run_id = %entry.run_id, "{}", entry.event);
            }
            TransferEvent::Error { .. } => {
                tracing::warn!(component = entry.component, run_id = %entry.run_id, "{}", entry.event);
            }
            _ => {
                tracing::info!(component = entry.component, run_id = %entry.run_id, "{}", entry.event);
            }
        }
    }
}

/// Discards everything.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
