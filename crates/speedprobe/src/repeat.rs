/// Repeat mode: back-to-back runs inside a fixed window.
///
/// `RepeatState` holds the aggregate the task reports while a window is open.
/// `RepeatOrchestrator` owns the driver task: it subscribes a relay listener
/// on the transfer task, restarts the operation after every completed run,
/// ticks `on_report` and closes the window when its timer fires.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use speedprobe_types::{RoundingMode, SpeedTestError, SpeedTestMode, SpeedTestReport};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::clock;
use crate::listener::{RepeatListener, SpeedTestListener};
use crate::logging::TransferEvent;
use crate::task::{Operation, RunOptions, TransferTask, tick};

// ── Aggregate state ─────────────────────────────────────────────────────

#[derive(Default)]
struct RepeatInner {
    /// Bumped by every `init`; stale drivers compare against it.
    generation: u64,
    repeat_download: bool,
    repeat_upload: bool,
    /// True until the first sub-request of the window connects.
    first_download: bool,
    first_upload: bool,
    window: Duration,
    start: u64,
    end: u64,
    total_bytes: u64,
    temp_bytes: u64,
    rates: Vec<f64>,
    request_count: u32,
    /// The task still holds the run that was last appended to `rates`.
    run_recorded: bool,
    finished: bool,
}

impl RepeatInner {
    fn active(&self) -> bool {
        self.repeat_download || self.repeat_upload
    }
}

#[derive(Default)]
pub struct RepeatState {
    inner: Mutex<RepeatInner>,
}

impl RepeatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh window. Clears everything from the previous one and
    /// returns the window's generation.
    pub fn init(&self, mode: SpeedTestMode, window: Duration) -> u64 {
        let mut inner = self.inner.lock();
        let generation = inner.generation + 1;
        *inner = RepeatInner {
            generation,
            repeat_download: mode == SpeedTestMode::Download,
            repeat_upload: mode == SpeedTestMode::Upload,
            first_download: mode == SpeedTestMode::Download,
            first_upload: mode == SpeedTestMode::Upload,
            window,
            ..RepeatInner::default()
        };
        generation
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// The first connect of the window sets the report start time.
    pub fn on_connected(&self, now: u64) {
        let mut inner = self.inner.lock();
        if inner.repeat_download && inner.first_download {
            inner.first_download = false;
            inner.start = now;
        } else if inner.repeat_upload && inner.first_upload {
            inner.first_upload = false;
            inner.start = now;
        }
    }

    pub fn add_total(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        if inner.active() {
            inner.total_bytes += bytes;
        }
    }

    pub fn add_temp(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        if inner.active() {
            inner.temp_bytes += bytes;
        }
    }

    /// Forget bytes of an upload attempt that is being re-sent elsewhere.
    pub fn rewind_temp(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.temp_bytes = inner.temp_bytes.saturating_sub(bytes);
    }

    /// Append one completed run's rate. Returns the new request count.
    pub fn record_run(&self, rate: f64) -> u32 {
        let mut inner = self.inner.lock();
        inner.rates.push(rate);
        inner.request_count += 1;
        inner.run_recorded = true;
        inner.request_count
    }

    /// A new run replaces the recorded one in the task's stats.
    pub fn begin_run(&self) {
        self.inner.lock().run_recorded = false;
    }

    /// Mark window `generation` finished. Only the first call for the current
    /// window has any effect.
    pub fn finish(&self, generation: u64, now: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.finished {
            return false;
        }
        inner.finished = true;
        inner.end = now;
        true
    }

    /// Stop delegating task reports to the aggregate, unless a newer window
    /// has taken over.
    pub fn deactivate(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.repeat_download = false;
        inner.repeat_upload = false;
    }

    /// Window report. `run` is the task's report for the run in flight; its
    /// rate and completion weigh the partial run.
    pub fn report(&self, now: u64, run: &SpeedTestReport, scale: u32, rounding: RoundingMode) -> SpeedTestReport {
        let inner = self.inner.lock();
        let mode = if inner.repeat_download {
            SpeedTestMode::Download
        } else if inner.repeat_upload {
            SpeedTestMode::Upload
        } else {
            SpeedTestMode::None
        };
        let report_time = if inner.end != 0 { inner.end } else { now };

        let progress = if inner.finished {
            100.0
        } else if inner.start == 0 || inner.window.is_zero() {
            0.0
        } else {
            let elapsed = report_time.saturating_sub(inner.start) as f64;
            (elapsed * 100.0 / inner.window.as_nanos() as f64).min(100.0) as f32
        };

        let rate = if inner.run_recorded {
            aggregate_rate(&inner.rates, 0.0, 0, 0)
        } else {
            aggregate_rate(
                &inner.rates,
                run.transfer_rate_octet(),
                run.temporary_packet_size(),
                run.total_packet_size(),
            )
        };

        SpeedTestReport::new(
            mode,
            progress,
            inner.start,
            report_time,
            inner.temp_bytes,
            inner.total_bytes,
            rounding.round(rate, scale),
            inner.request_count,
        )
    }
}

/// `(Σ history + current) / (len(history) + temp / total)`, or `current` while
/// the history is empty. `temp` and `total` belong to the in-flight run only.
pub fn aggregate_rate(history: &[f64], current: f64, temp_bytes: u64, total_bytes: u64) -> f64 {
    if history.is_empty() {
        return current;
    }
    let fraction = if total_bytes == 0 {
        0.0
    } else {
        temp_bytes as f64 / total_bytes as f64
    };
    (history.iter().sum::<f64>() + current) / (history.len() as f64 + fraction)
}

// ── Relay ───────────────────────────────────────────────────────────────

enum RunEvent {
    Completed,
    Failed(SpeedTestError),
}

/// Subscribed on the task for the lifetime of one window.
struct RepeatRelay {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl SpeedTestListener for RepeatRelay {
    fn on_completion(&self, _report: &SpeedTestReport) {
        let _ = self.tx.send(RunEvent::Completed);
    }

    fn on_error(&self, error: SpeedTestError, _message: &str) {
        let _ = self.tx.send(RunEvent::Failed(error));
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────

pub struct RepeatOrchestrator {
    task: TransferTask,
    driver: Mutex<Option<CancellationToken>>,
}

struct Window {
    uri: String,
    op: Operation,
    window: Duration,
    report_interval: Option<Duration>,
    listener: Arc<dyn RepeatListener>,
}

impl RepeatOrchestrator {
    pub fn new(task: TransferTask) -> Self {
        Self {
            task,
            driver: Mutex::new(None),
        }
    }

    pub fn start_download(
        &self,
        uri: &str,
        window: Duration,
        report_interval: Option<Duration>,
        listener: Arc<dyn RepeatListener>,
    ) {
        self.start(Window {
            uri: uri.to_string(),
            op: Operation::Download,
            window,
            report_interval,
            listener,
        });
    }

    pub fn start_upload(
        &self,
        uri: &str,
        window: Duration,
        report_interval: Option<Duration>,
        size: u64,
        listener: Arc<dyn RepeatListener>,
    ) {
        self.start(Window {
            uri: uri.to_string(),
            op: Operation::Upload { size },
            window,
            report_interval,
            listener,
        });
    }

    /// Cancel the current window, if any, without notifying its listener.
    pub fn cancel(&self) {
        if let Some(token) = self.driver.lock().take() {
            token.cancel();
        }
    }

    fn start(&self, window: Window) {
        self.cancel();

        let token = CancellationToken::new();
        *self.driver.lock() = Some(token.clone());

        let generation = self.task.repeat_state().init(window.op.mode(), window.window);

        let (tx, rx) = mpsc::unbounded_channel();
        let relay: Arc<dyn SpeedTestListener> = Arc::new(RepeatRelay { tx });
        self.task.listeners().add(relay.clone());

        let driver = Driver {
            task: self.task.clone(),
            session: Uuid::new_v4(),
            generation,
            relay,
            token,
        };
        // The driver must be subscribed before the first run can dispatch.
        self.task.start_with(&window.uri, window.op, RunOptions::repeat());
        self.task.runtime().spawn(driver.run(window, rx));
    }
}

struct Driver {
    task: TransferTask,
    session: Uuid,
    generation: u64,
    relay: Arc<dyn SpeedTestListener>,
    token: CancellationToken,
}

impl Driver {
    async fn run(self, window: Window, mut rx: mpsc::UnboundedReceiver<RunEvent>) {
        let expiry = tokio::time::sleep(window.window);
        tokio::pin!(expiry);
        let mut ticker = window
            .report_interval
            .filter(|p| !p.is_zero())
            .map(|p| tokio::time::interval_at(Instant::now() + p, p));

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    self.task.listeners().remove(&self.relay);
                    let state = self.task.repeat_state();
                    state.finish(self.generation, clock::now_nanos());
                    state.deactivate(self.generation);
                    debug!(session = %self.session, "repeat window cancelled");
                    return;
                }

                _ = &mut expiry => {
                    self.close_window(&window);
                    return;
                }

                _ = tick(&mut ticker) => {
                    window.listener.on_report(&self.task.report());
                }

                event = rx.recv() => match event {
                    Some(RunEvent::Completed) => {
                        if self.token.is_cancelled() {
                            continue;
                        }
                        let rate = self.task.last_run_rate();
                        let request_num = self.task.repeat_state().record_run(rate);
                        self.task.log_event(
                            "repeat",
                            self.session,
                            TransferEvent::RepeatRunCompleted { request_num, rate_octet: rate },
                        );
                        self.task.shutdown_and_wait().await;
                        if !self.token.is_cancelled() && !self.task.repeat_state().is_finished() {
                            self.task.start_with(&window.uri, window.op, RunOptions::repeat());
                        }
                    }
                    Some(RunEvent::Failed(error)) => {
                        debug!(session = %self.session, "repeat window aborted: {}", error);
                        self.teardown().await;
                        return;
                    }
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
            }
        }
    }

    fn close_window(&self, window: &Window) {
        let state = self.task.repeat_state();
        self.task.listeners().remove(&self.relay);
        if self.token.is_cancelled() || !state.finish(self.generation, clock::now_nanos()) {
            return;
        }
        self.task.force_stop_task();

        let report = self.task.report();
        self.task.log_event(
            "repeat",
            self.session,
            TransferEvent::RepeatWindowClosed {
                request_num: report.request_num(),
                window_ms: window.window.as_millis() as u64,
            },
        );
        window.listener.on_completion(&report);
        state.deactivate(self.generation);
    }

    async fn teardown(&self) {
        let state = self.task.repeat_state();
        self.task.listeners().remove(&self.relay);
        if !state.finish(self.generation, clock::now_nanos()) {
            return;
        }
        self.task.close_socket();
        self.task.shutdown_and_wait().await;
        state.deactivate(self.generation);
    }
}
