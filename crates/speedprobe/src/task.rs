/// The transfer task: one download or upload at a time.
///
/// `start_with` validates the URI, tears down any previous run and spawns the
/// new run on the runtime. A run is a single tokio task that selects over the
/// transfer itself, its cancellation token, an optional progress tick and an
/// optional deadline. Whatever ends the run, listeners see exactly one
/// completion or one error, and nothing after it.
///
/// Runs are numbered. A run whose number is no longer current was superseded
/// by a newer start and exits without dispatching anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use speedprobe_types::{SpeedTestMode, SpeedTestReport};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::clock;
use crate::config::SpeedTestConfig;
use crate::error::TaskError;
use crate::ftp::FtpClient;
use crate::http;
use crate::listener::ListenerRegistry;
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::payload::{Payload, RandomPayloadGenerator};
use crate::protocol::{self, DOWNLOAD_BUFFER_SIZE, MAX_REDIRECTS, SHUTDOWN_WAIT, Scheme};
use crate::repeat::RepeatState;
use crate::stats::TransferStats;
use crate::transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Download,
    Upload { size: u64 },
}

impl Operation {
    pub fn mode(self) -> SpeedTestMode {
        match self {
            Self::Download => SpeedTestMode::Download,
            Self::Upload { .. } => SpeedTestMode::Upload,
        }
    }
}

/// Per-run knobs layered over the shared configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Dispatch progress on this period instead of after every chunk.
    pub report_interval: Option<Duration>,
    /// Close the run and complete after this long.
    pub duration: Option<Duration>,
    /// Dispatch no per-chunk progress at all.
    pub quiet: bool,
}

impl RunOptions {
    pub fn with_interval(report_interval: Option<Duration>) -> Self {
        Self {
            report_interval,
            ..Self::default()
        }
    }

    pub fn fixed(duration: Duration, report_interval: Option<Duration>) -> Self {
        Self {
            report_interval,
            duration: Some(duration),
            quiet: false,
        }
    }

    /// Runs driven by a repeat window.
    pub fn repeat() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }
}

/// Identity and configuration snapshot of one run.
struct Run {
    id: Uuid,
    generation: u64,
    config: SpeedTestConfig,
}

struct ActiveRun {
    generation: u64,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct TaskInner {
    config: Arc<RwLock<SpeedTestConfig>>,
    listeners: Arc<ListenerRegistry>,
    stats: TransferStats,
    repeat: RepeatState,
    logger: RwLock<Arc<dyn TransferLogger>>,
    runtime: Handle,
    current: Mutex<Option<ActiveRun>>,
    generation: AtomicU64,
    force_close: AtomicBool,
    error_dispatched: AtomicBool,
    /// Per-chunk progress is suppressed while set.
    report_interval: AtomicBool,
}

/// Cheap handle; clones share the same task.
#[derive(Clone)]
pub struct TransferTask {
    inner: Arc<TaskInner>,
}

impl TransferTask {
    pub fn new(
        config: Arc<RwLock<SpeedTestConfig>>,
        listeners: Arc<ListenerRegistry>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                config,
                listeners,
                stats: TransferStats::new(),
                repeat: RepeatState::new(),
                logger: RwLock::new(Arc::new(TracingLogger)),
                runtime,
                current: Mutex::new(None),
                generation: AtomicU64::new(0),
                force_close: AtomicBool::new(false),
                error_dispatched: AtomicBool::new(false),
                report_interval: AtomicBool::new(false),
            }),
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    pub fn repeat_state(&self) -> &RepeatState {
        &self.inner.repeat
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn set_logger(&self, logger: Arc<dyn TransferLogger>) {
        *self.inner.logger.write() = logger;
    }

    pub fn log_event(&self, component: &'static str, run_id: Uuid, event: TransferEvent) {
        let logger = self.inner.logger.read().clone();
        logger.log(TransferLog {
            component,
            run_id,
            event,
        });
    }

    fn config(&self) -> SpeedTestConfig {
        self.inner.config.read().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn start_download(&self, uri: &str, options: RunOptions) {
        self.start_with(uri, Operation::Download, options);
    }

    pub fn start_upload(&self, uri: &str, size: u64, options: RunOptions) {
        self.start_with(uri, Operation::Upload { size }, options);
    }

    /// Start `op` against `uri`, replacing any run in flight.
    ///
    /// URI and scheme errors are dispatched before this returns.
    pub fn start_with(&self, uri: &str, op: Operation, options: RunOptions) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.inner.current.lock().take() {
            previous.token.cancel();
        }

        self.inner.stats.reset(op.mode());
        self.inner.repeat.begin_run();
        self.inner.force_close.store(false, Ordering::SeqCst);
        self.inner.error_dispatched.store(false, Ordering::SeqCst);
        self.inner.report_interval.store(
            options.quiet || options.report_interval.is_some(),
            Ordering::SeqCst,
        );

        let run_id = Uuid::new_v4();
        let (url, scheme) = match protocol::parse_uri(uri) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail(run_id, &e);
                return;
            }
        };

        let token = CancellationToken::new();
        *self.inner.current.lock() = Some(ActiveRun {
            generation,
            token: token.clone(),
            handle: None,
        });

        let task = self.clone();
        let handle = self
            .inner
            .runtime
            .spawn(async move { task.run(generation, run_id, url, scheme, op, options, token).await });

        if let Some(run) = self.inner.current.lock().as_mut() {
            if run.generation == generation {
                run.handle = Some(handle);
            }
        }
    }

    /// Stop the current run; its listeners get one `ForceCloseSocket`.
    pub fn force_stop_task(&self) {
        let current = self.inner.current.lock();
        if let Some(run) = current.as_ref() {
            if !run.token.is_cancelled() {
                self.inner.force_close.store(true, Ordering::SeqCst);
                run.token.cancel();
                self.log_event("task", Uuid::nil(), TransferEvent::ForceStop);
            }
        }
    }

    /// Close the current connection without flagging a force stop.
    pub fn close_socket(&self) {
        if let Some(run) = self.inner.current.lock().as_ref() {
            run.token.cancel();
        }
    }

    /// Wait up to 500 ms for the current run to wind down.
    pub async fn shutdown_and_wait(&self) {
        let handle = self
            .inner
            .current
            .lock()
            .as_mut()
            .and_then(|run| run.handle.take());
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                warn!("transfer did not stop within {:?}", SHUTDOWN_WAIT);
            }
        }
    }

    // ── Reports ─────────────────────────────────────────────────────────

    /// Live report; the repeat aggregate while a repeat window is open.
    pub fn report(&self) -> SpeedTestReport {
        self.report_at(clock::now_nanos())
    }

    pub(crate) fn report_at(&self, now: u64) -> SpeedTestReport {
        let config = self.config();
        let run = self.inner.stats.report_at(now, &config);
        self.aggregate(now, run, &config)
    }

    /// Progress snapshot that leaves the caller's interval window alone.
    fn peek_at(&self, now: u64) -> SpeedTestReport {
        let config = self.config();
        let run = self.inner.stats.peek_at(now, &config);
        self.aggregate(now, run, &config)
    }

    /// Completion report; the run rate is its cumulative average.
    fn final_report_at(&self, now: u64) -> SpeedTestReport {
        let config = self.config();
        let run = self.inner.stats.final_report_at(now, &config);
        self.aggregate(now, run, &config)
    }

    fn aggregate(&self, now: u64, run: SpeedTestReport, config: &SpeedTestConfig) -> SpeedTestReport {
        if self.inner.repeat.is_active() {
            self.inner.repeat.report(now, &run, config.scale, config.rounding_mode)
        } else {
            run
        }
    }

    /// All-time average of the latest run, ignoring repeat aggregation.
    pub fn last_run_rate(&self) -> f64 {
        let config = self.inner.config.read().clone();
        self.inner.stats.average_rate_at(clock::now_nanos(), &config)
    }

    // ── Run ─────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run(
        self,
        generation: u64,
        run_id: Uuid,
        url: Url,
        scheme: Scheme,
        op: Operation,
        options: RunOptions,
        token: CancellationToken,
    ) {
        self.log_event(
            "task",
            run_id,
            TransferEvent::Connecting {
                mode: op.mode(),
                uri: url.to_string(),
            },
        );

        let ctx = Run {
            id: run_id,
            generation,
            config: self.config(),
        };
        let mut work = Box::pin(self.execute(&ctx, url, scheme, op));

        let deadline = async {
            match options.duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut ticker = options
            .report_interval
            .filter(|p| !p.is_zero())
            .map(|p| tokio::time::interval_at(Instant::now() + p, p));

        let result = loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break Err(TaskError::Closed),

                res = &mut work => break res,

                _ = &mut deadline => break Ok(()),

                _ = tick(&mut ticker) => {
                    if self.is_current(generation) {
                        let report = self.report();
                        self.inner.listeners.dispatch_progress(report.progress_percent(), &report);
                    }
                }
            }
        };
        // Drop the connection before anyone hears about the outcome.
        drop(work);

        self.finish(generation, run_id, result);
    }

    fn finish(&self, generation: u64, run_id: Uuid, result: Result<(), TaskError>) {
        if !self.is_current(generation) {
            return;
        }
        match result {
            Ok(()) => {
                let now = clock::now_nanos();
                self.inner.stats.mark_end(now);
                let report = self.final_report_at(now);
                self.log_event(
                    "task",
                    run_id,
                    TransferEvent::Completed {
                        bytes: self.inner.stats.temp_bytes(),
                        duration_ms: report.elapsed_nanos() / 1_000_000,
                        rate_octet: report.transfer_rate_octet(),
                    },
                );
                self.inner.listeners.dispatch_completion(&report);
            }
            Err(e) => self.fail(run_id, &e),
        }
    }

    fn fail(&self, run_id: Uuid, error: &TaskError) {
        if self.inner.error_dispatched.swap(true, Ordering::SeqCst) {
            return;
        }
        let kind = error.kind_for(self.inner.force_close.load(Ordering::SeqCst));
        self.log_event(
            "task",
            run_id,
            TransferEvent::Error {
                message: format!("{kind}: {error}"),
            },
        );
        self.inner.listeners.dispatch_error(kind, &error.to_string());
    }

    async fn execute(&self, run: &Run, url: Url, scheme: Scheme, op: Operation) -> Result<(), TaskError> {
        match (scheme, op) {
            (Scheme::Ftp, Operation::Download) => self.ftp_download(run, url).await,
            (Scheme::Ftp, Operation::Upload { size }) => self.ftp_upload(run, url, size).await,
            (_, Operation::Download) => self.http_download(run, url).await,
            (_, Operation::Upload { size }) => self.http_upload(run, url, size).await,
        }
    }

    // ── Run hooks ───────────────────────────────────────────────────────

    fn setup_nanos(&self, config: &SpeedTestConfig) -> u64 {
        let setup = match self.inner.stats.mode() {
            SpeedTestMode::Upload => config.upload_setup_time,
            _ => config.download_setup_time,
        };
        u64::try_from(setup.as_nanos()).unwrap_or(u64::MAX)
    }

    fn on_connected(&self, run: &Run, addr: Option<String>) {
        if !self.is_current(run.generation) {
            return;
        }
        let now = clock::now_nanos();
        self.inner.stats.mark_start(now, self.setup_nanos(&run.config));
        self.inner.repeat.on_connected(now);
        self.log_event(
            "task",
            run.id,
            TransferEvent::Connected {
                addr: addr.unwrap_or_default(),
            },
        );
    }

    fn record_chunk(&self, run: &Run, n: usize) {
        if !self.is_current(run.generation) {
            return;
        }
        let total = self
            .inner
            .stats
            .record_bytes(n as u64, clock::now_nanos(), self.setup_nanos(&run.config));
        self.inner.repeat.add_temp(n as u64);
        self.log_event("task", run.id, TransferEvent::ChunkTransferred { size: n, total });

        if !self.inner.report_interval.load(Ordering::Relaxed) {
            let report = self.peek_at(clock::now_nanos());
            self.inner.listeners.dispatch_progress(report.progress_percent(), &report);
        }
    }

    async fn generate_payload(&self, size: u64, config: &SpeedTestConfig) -> Result<Payload, TaskError> {
        let storage = config.upload_storage_type;
        tokio::task::spawn_blocking(move || RandomPayloadGenerator::generate(size, storage))
            .await
            .map_err(|e| TaskError::Connection(format!("payload generation aborted: {e}")))?
            .map_err(TaskError::from)
    }

    // ── HTTP ────────────────────────────────────────────────────────────

    async fn http_download(&self, run: &Run, mut url: Url) -> Result<(), TaskError> {
        let config = &run.config;
        let timeout = config.socket_timeout;
        let mut hops = 0u32;

        loop {
            let scheme = protocol::scheme_of(&url)?;
            if !scheme.is_http() {
                return Err(TaskError::UnsupportedProtocol(url.scheme().to_string()));
            }
            let (host, port) = protocol::endpoint(&url)?;
            let mut conn = transport::connect_http(&host, port, scheme, config.proxy.as_ref(), timeout).await?;
            self.on_connected(run, conn.stream.peer_addr());

            let request = protocol::download_request(&url, conn.via_proxy);
            transport::write_all(&mut conn.stream, request.as_bytes(), timeout).await?;

            let mut buf = BytesMut::with_capacity(DOWNLOAD_BUFFER_SIZE);
            let head = http::read_response_head(&mut conn.stream, &mut buf, timeout).await?;

            if head.is_ok() {
                let total = match head.content_length {
                    Some(n) if n > 0 => n,
                    _ => return Err(TaskError::InconsistentContentLength),
                };
                self.inner.stats.set_total(total);
                self.inner.repeat.add_total(total);

                let mut received = 0u64;
                if !buf.is_empty() {
                    let n = (buf.len() as u64).min(total) as usize;
                    received += n as u64;
                    self.record_chunk(run, n);
                }

                let mut chunk = vec![0u8; DOWNLOAD_BUFFER_SIZE];
                while received < total {
                    let want = (total - received).min(DOWNLOAD_BUFFER_SIZE as u64) as usize;
                    let n = transport::read_some(&mut conn.stream, &mut chunk[..want], timeout).await?;
                    if n == 0 {
                        return Err(TaskError::Connection(format!(
                            "connection closed after {received} of {total} bytes"
                        )));
                    }
                    received += n as u64;
                    self.record_chunk(run, n);
                }
                return Ok(());
            }

            if protocol::is_redirect(head.status) {
                let location = head
                    .location()
                    .ok_or_else(|| TaskError::invalid_response(head.status, "redirect without Location"))?;
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(TaskError::invalid_response(head.status, "too many redirects"));
                }
                let next = protocol::resolve_location(&url, location)?;
                self.log_event(
                    "task",
                    run.id,
                    TransferEvent::Redirect {
                        status: head.status,
                        location: next.to_string(),
                        hop: hops,
                    },
                );
                url = next;
                continue;
            }

            return Err(TaskError::invalid_response(head.status, head.reason));
        }
    }

    async fn http_upload(&self, run: &Run, mut url: Url, size: u64) -> Result<(), TaskError> {
        let config = &run.config;
        let timeout = config.socket_timeout;
        let chunk_size = config.upload_chunk_size.max(1);
        let mut payload = self.generate_payload(size, config).await?;
        self.inner.repeat.add_total(size);
        let mut hops = 0u32;

        loop {
            let scheme = protocol::scheme_of(&url)?;
            if !scheme.is_http() {
                return Err(TaskError::UnsupportedProtocol(url.scheme().to_string()));
            }
            let (host, port) = protocol::endpoint(&url)?;
            let mut conn = transport::connect_http(&host, port, scheme, config.proxy.as_ref(), timeout).await?;
            self.on_connected(run, conn.stream.peer_addr());
            self.inner.stats.set_total(size);

            let head = protocol::upload_request_head(&url, size, conn.via_proxy);
            transport::write_all(&mut conn.stream, head.as_bytes(), timeout).await?;

            let mut offset = 0u64;
            while offset < size {
                let data = payload.read_chunk(offset, chunk_size).await?;
                if data.is_empty() {
                    break;
                }
                transport::write_all(&mut conn.stream, &data, timeout).await?;
                offset += data.len() as u64;
                self.record_chunk(run, data.len());
            }
            tokio::time::timeout(timeout, conn.stream.flush())
                .await
                .map_err(|_| TaskError::Timeout(timeout))??;

            let mut buf = BytesMut::with_capacity(1024);
            let head = http::read_response_head(&mut conn.stream, &mut buf, timeout).await?;

            if head.status == 200 {
                return Ok(());
            }

            if protocol::is_redirect(head.status) {
                let location = head
                    .location()
                    .ok_or_else(|| TaskError::invalid_response(head.status, "redirect without Location"))?;
                let next = protocol::resolve_location(&url, location)?;
                if next.scheme() == "https" {
                    return Err(TaskError::UnsupportedProtocol("https upload redirect".into()));
                }
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(TaskError::invalid_response(head.status, "too many redirects"));
                }
                self.log_event(
                    "task",
                    run.id,
                    TransferEvent::Redirect {
                        status: head.status,
                        location: next.to_string(),
                        hop: hops,
                    },
                );
                // The body goes out again in full.
                self.inner.repeat.rewind_temp(offset);
                self.inner.stats.reset(SpeedTestMode::Upload);
                url = next;
                continue;
            }

            return Err(TaskError::invalid_response(head.status, head.reason));
        }
    }

    // ── FTP ─────────────────────────────────────────────────────────────

    async fn ftp_session(&self, url: &Url, config: &SpeedTestConfig) -> Result<FtpClient, TaskError> {
        let (host, port) = protocol::endpoint(url)?;
        let user = if url.username().is_empty() {
            "anonymous"
        } else {
            url.username()
        };
        let password = url.password().unwrap_or("");

        let tcp = transport::dial(&host, port, config.socket_timeout).await?;
        let mut ftp = FtpClient::new(tcp, config.socket_timeout).await?;
        ftp.login(user, password).await?;
        ftp.set_mode(config.ftp_mode);
        ftp.binary().await?;
        Ok(ftp)
    }

    async fn ftp_download(&self, run: &Run, url: Url) -> Result<(), TaskError> {
        let config = &run.config;
        let timeout = config.socket_timeout;
        let mut ftp = self.ftp_session(&url, config).await?;

        let total = ftp
            .remote_size(url.path())
            .await?
            .filter(|n| *n > 0)
            .ok_or(TaskError::InconsistentContentLength)?;

        let mut data = ftp.retrieve(url.path()).await?;
        self.on_connected(run, data.peer_addr().ok().map(|a| a.to_string()));
        self.inner.stats.set_total(total);
        self.inner.repeat.add_total(total);

        let mut received = 0u64;
        let mut chunk = vec![0u8; DOWNLOAD_BUFFER_SIZE];
        while received < total {
            let n = transport::read_some(&mut data, &mut chunk, timeout).await?;
            if n == 0 {
                break;
            }
            received += n as u64;
            self.record_chunk(run, n);
        }
        drop(data);

        ftp.finish_transfer().await?;
        if let Err(e) = ftp.quit().await {
            warn!("ftp quit failed: {}", e);
        }
        Ok(())
    }

    async fn ftp_upload(&self, run: &Run, url: Url, size: u64) -> Result<(), TaskError> {
        let config = &run.config;
        let timeout = config.socket_timeout;
        let chunk_size = config.upload_chunk_size.max(1);
        let mut payload = self.generate_payload(size, config).await?;
        let mut ftp = self.ftp_session(&url, config).await?;

        let mut data = ftp.store(url.path()).await?;
        self.on_connected(run, data.peer_addr().ok().map(|a| a.to_string()));
        self.inner.stats.set_total(size);
        self.inner.repeat.add_total(size);

        let mut offset = 0u64;
        while offset < size {
            let chunk = payload.read_chunk(offset, chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            transport::write_all(&mut data, &chunk, timeout).await?;
            offset += chunk.len() as u64;
            self.record_chunk(run, chunk.len());
        }
        tokio::time::timeout(timeout, data.shutdown())
            .await
            .map_err(|_| TaskError::Timeout(timeout))??;
        drop(data);

        ftp.finish_transfer().await?;
        if let Err(e) = ftp.quit().await {
            warn!("ftp quit failed: {}", e);
        }
        Ok(())
    }
}

/// Next tick of an optional ticker; pends forever without one.
pub(crate) async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
