use serde::{Deserialize, Serialize};

use crate::models::SpeedTestMode;

/// One measurement point. Built fresh for every query and never mutated.
///
/// Timestamps are nanoseconds from a single process-wide monotonic origin, so
/// only differences between them are meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestReport {
    mode: SpeedTestMode,
    progress_percent: f32,
    start_time: u64,
    report_time: u64,
    temporary_packet_size: u64,
    total_packet_size: u64,
    transfer_rate_octet: f64,
    transfer_rate_bit: f64,
    request_num: u32,
}

impl SpeedTestReport {
    /// The bit rate is derived here from the octet rate and cannot be passed in.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: SpeedTestMode,
        progress_percent: f32,
        start_time: u64,
        report_time: u64,
        temporary_packet_size: u64,
        total_packet_size: u64,
        transfer_rate_octet: f64,
        request_num: u32,
    ) -> Self {
        Self {
            mode,
            progress_percent: progress_percent.clamp(0.0, 100.0),
            start_time,
            report_time,
            temporary_packet_size,
            total_packet_size,
            transfer_rate_octet,
            transfer_rate_bit: transfer_rate_octet * 8.0,
            request_num,
        }
    }

    /// Report for a task that has not moved anything yet.
    pub fn empty(mode: SpeedTestMode) -> Self {
        Self::new(mode, 0.0, 0, 0, 0, 0, 0.0, 0)
    }

    pub fn mode(&self) -> SpeedTestMode {
        self.mode
    }

    pub fn progress_percent(&self) -> f32 {
        self.progress_percent
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn report_time(&self) -> u64 {
        self.report_time
    }

    pub fn temporary_packet_size(&self) -> u64 {
        self.temporary_packet_size
    }

    pub fn total_packet_size(&self) -> u64 {
        self.total_packet_size
    }

    /// Bytes per second.
    pub fn transfer_rate_octet(&self) -> f64 {
        self.transfer_rate_octet
    }

    /// Bits per second.
    pub fn transfer_rate_bit(&self) -> f64 {
        self.transfer_rate_bit
    }

    pub fn request_num(&self) -> u32 {
        self.request_num
    }

    /// Nanoseconds between the transfer start and this report.
    pub fn elapsed_nanos(&self) -> u64 {
        self.report_time.saturating_sub(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_rate_is_eight_times_octet_rate() {
        let report = SpeedTestReport::new(SpeedTestMode::Download, 50.0, 10, 20, 5, 10, 1234.5678, 1);
        assert_eq!(report.transfer_rate_bit(), report.transfer_rate_octet() * 8.0);
        assert_eq!(report.elapsed_nanos(), 10);
    }

    #[test]
    fn progress_is_clamped() {
        let report = SpeedTestReport::new(SpeedTestMode::Upload, 140.0, 0, 0, 0, 0, 0.0, 1);
        assert_eq!(report.progress_percent(), 100.0);
    }

    #[test]
    fn empty_report_is_zeroed() {
        let report = SpeedTestReport::empty(SpeedTestMode::None);
        assert_eq!(report.mode(), SpeedTestMode::None);
        assert_eq!(report.transfer_rate_bit(), 0.0);
        assert_eq!(report.request_num(), 0);
    }

    #[test]
    fn serializes_with_field_names() {
        let report = SpeedTestReport::new(SpeedTestMode::Download, 100.0, 1, 2, 3, 3, 1.5, 1);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "download");
        assert_eq!(json["transfer_rate_bit"], 12.0);
    }
}
