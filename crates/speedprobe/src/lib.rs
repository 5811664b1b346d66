//! Client-side bandwidth measurement.
//!
//! `SpeedTestClient` runs HTTP, HTTPS and FTP downloads and uploads against a
//! remote server and reports transfer rates to registered listeners, either
//! for one transfer or for back-to-back transfers inside a fixed window.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod ftp;
pub mod http;
pub mod listener;
pub mod logging;
pub mod payload;
pub mod protocol;
pub mod repeat;
pub mod stats;
pub mod task;
pub mod transport;

pub use client::SpeedTestClient;
pub use config::{ProxyServer, SpeedTestConfig};
pub use error::TaskError;
pub use listener::{RepeatListener, SpeedTestListener};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use payload::{Payload, RandomPayloadGenerator};
pub use speedprobe_types::{
    ComputationMethod, FtpMode, RoundingMode, SpeedTestError, SpeedTestMode, SpeedTestReport,
    UploadStorageType,
};
