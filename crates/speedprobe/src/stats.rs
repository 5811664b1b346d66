/// Transfer statistics for the current run.
///
/// Byte counters and timestamps are atomics so any thread can snapshot a
/// report. The two rate windows (computation and interval) move together and
/// sit behind one short lock.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use speedprobe_types::{ComputationMethod, SpeedTestMode, SpeedTestReport};

use crate::config::SpeedTestConfig;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Default)]
struct Windows {
    /// 0 until the setup time has passed and a chunk arrived.
    compute_start: u64,
    compute_base: u64,
    interval_start: u64,
    interval_base: u64,
}

impl Windows {
    fn open(&mut self, now: u64, base: u64) {
        self.compute_start = now;
        self.compute_base = base;
        self.interval_start = now;
        self.interval_base = base;
    }
}

pub struct TransferStats {
    mode: AtomicU8,
    /// Bytes moved so far in this run.
    temp_bytes: AtomicU64,
    /// Expected bytes for this run (Content-Length, remote size or upload size).
    total_bytes: AtomicU64,
    time_start: AtomicU64,
    time_end: AtomicU64,
    windows: Mutex<Windows>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            mode: AtomicU8::new(SpeedTestMode::None.as_u8()),
            temp_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            time_start: AtomicU64::new(0),
            time_end: AtomicU64::new(0),
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Clear everything for a new run.
    pub fn reset(&self, mode: SpeedTestMode) {
        let mut windows = self.windows.lock();
        *windows = Windows::default();
        self.mode.store(mode.as_u8(), Ordering::Relaxed);
        self.temp_bytes.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.time_start.store(0, Ordering::Relaxed);
        self.time_end.store(0, Ordering::Relaxed);
    }

    /// Transfer clock starts. Without a setup time the computation window
    /// opens here too.
    pub fn mark_start(&self, now: u64, setup_nanos: u64) {
        let mut windows = self.windows.lock();
        self.time_start.store(now, Ordering::Relaxed);
        if setup_nanos == 0 {
            windows.open(now, self.temp_bytes.load(Ordering::Relaxed));
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    pub fn mark_end(&self, now: u64) {
        let _ = self
            .time_end
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Count `n` bytes. Returns the running total.
    pub fn record_bytes(&self, n: u64, now: u64, setup_nanos: u64) -> u64 {
        let temp = self.temp_bytes.fetch_add(n, Ordering::Relaxed) + n;
        let start = self.time_start.load(Ordering::Relaxed);
        if start != 0 {
            let mut windows = self.windows.lock();
            if windows.compute_start == 0 && now.saturating_sub(start) >= setup_nanos {
                windows.open(now, temp);
            }
        }
        temp
    }

    pub fn mode(&self) -> SpeedTestMode {
        SpeedTestMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub fn temp_bytes(&self) -> u64 {
        self.temp_bytes.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn time_start(&self) -> u64 {
        self.time_start.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.time_end.load(Ordering::Relaxed) != 0
    }

    pub fn progress(&self) -> f32 {
        if self.is_finished() {
            return 100.0;
        }
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        let temp = self.temp_bytes();
        ((temp as f64 * 100.0 / total as f64).min(100.0)) as f32
    }

    /// Live report as of `now`. The interval method resets its window.
    pub fn report_at(&self, now: u64, config: &SpeedTestConfig) -> SpeedTestReport {
        self.build(now, config, config.computation_method, true)
    }

    /// Same as `report_at` but leaves the interval window where it is.
    pub fn peek_at(&self, now: u64, config: &SpeedTestConfig) -> SpeedTestReport {
        self.build(now, config, config.computation_method, false)
    }

    /// Terminal report: always the cumulative average, whatever the method.
    pub fn final_report_at(&self, now: u64, config: &SpeedTestConfig) -> SpeedTestReport {
        self.build(now, config, ComputationMethod::MedianAllTime, false)
    }

    fn build(&self, now: u64, config: &SpeedTestConfig, method: ComputationMethod, reset: bool) -> SpeedTestReport {
        let start = self.time_start();
        let end = self.time_end.load(Ordering::Relaxed);
        let report_time = if end != 0 { end } else { now };
        let temp = self.temp_bytes();

        let rate = {
            let mut windows = self.windows.lock();
            if windows.compute_start == 0 {
                0.0
            } else {
                match method {
                    ComputationMethod::MedianAllTime => {
                        rate(temp.saturating_sub(windows.compute_base), report_time.saturating_sub(windows.compute_start))
                    }
                    ComputationMethod::MedianInterval => {
                        let r = rate(
                            temp.saturating_sub(windows.interval_base),
                            report_time.saturating_sub(windows.interval_start),
                        );
                        if reset {
                            windows.interval_base = temp;
                            windows.interval_start = report_time;
                        }
                        r
                    }
                }
            }
        };

        SpeedTestReport::new(
            self.mode(),
            self.progress(),
            start,
            report_time,
            temp,
            self.total_bytes(),
            config.rounding_mode.round(rate, config.scale),
            1,
        )
    }

    /// Cumulative average over the whole computation window, without touching
    /// the interval counters.
    pub fn average_rate_at(&self, now: u64, config: &SpeedTestConfig) -> f64 {
        let end = self.time_end.load(Ordering::Relaxed);
        let report_time = if end != 0 { end } else { now };
        let windows = self.windows.lock();
        if windows.compute_start == 0 {
            return 0.0;
        }
        let r = rate(
            self.temp_bytes().saturating_sub(windows.compute_base),
            report_time.saturating_sub(windows.compute_start),
        );
        config.rounding_mode.round(r, config.scale)
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

fn rate(bytes: u64, nanos: u64) -> f64 {
    if nanos == 0 {
        return 0.0;
    }
    bytes as f64 * NANOS_PER_SEC / nanos as f64
}
