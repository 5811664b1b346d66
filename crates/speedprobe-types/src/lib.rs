//! Value types shared between the speedprobe library, its server and its CLI.

pub mod events;
pub mod models;
pub mod report;

pub use events::SpeedTestError;
pub use models::{
    ComputationMethod, FtpMode, ParseModelError, RoundingMode, SpeedTestMode, UploadStorageType,
};
pub use report::SpeedTestReport;
