/// `SpeedTestClient`: the public entry point.
///
/// Owns the configuration, the listener registry, one transfer task and one
/// repeat orchestrator. All `start_*` calls return immediately; results arrive
/// through listeners.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use speedprobe_types::{ComputationMethod, FtpMode, RoundingMode, SpeedTestReport, UploadStorageType};
use tokio::runtime::Handle;

use crate::config::{ProxyServer, SpeedTestConfig};
use crate::listener::{ListenerRegistry, RepeatListener, SpeedTestListener};
use crate::logging::TransferLogger;
use crate::repeat::RepeatOrchestrator;
use crate::task::{RunOptions, TransferTask};

fn get_or_create_runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("speedprobe")
            .build()
            .expect("Failed to create Tokio runtime")
    })
}

pub struct SpeedTestClient {
    config: Arc<RwLock<SpeedTestConfig>>,
    listeners: Arc<ListenerRegistry>,
    task: TransferTask,
    repeat: RepeatOrchestrator,
}

impl SpeedTestClient {
    /// Uses the current tokio runtime when called from inside one, otherwise a
    /// shared background runtime.
    pub fn new() -> Self {
        Self::with_config(SpeedTestConfig::default())
    }

    pub fn with_config(config: SpeedTestConfig) -> Self {
        let handle = Handle::try_current().unwrap_or_else(|_| get_or_create_runtime().handle().clone());
        Self::with_handle(config, handle)
    }

    pub fn with_handle(config: SpeedTestConfig, handle: Handle) -> Self {
        let config = Arc::new(RwLock::new(config));
        let listeners = Arc::new(ListenerRegistry::new());
        let task = TransferTask::new(config.clone(), listeners.clone(), handle);
        let repeat = RepeatOrchestrator::new(task.clone());
        Self {
            config,
            listeners,
            task,
            repeat,
        }
    }

    // ── Listeners ───────────────────────────────────────────────────────

    pub fn add_listener(&self, listener: Arc<dyn SpeedTestListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SpeedTestListener>) {
        self.listeners.remove(listener);
    }

    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    // ── Single runs ─────────────────────────────────────────────────────

    pub fn start_download(&self, uri: &str) {
        self.task.start_download(uri, RunOptions::default());
    }

    /// Progress every `interval` instead of per chunk.
    pub fn start_download_with_interval(&self, uri: &str, interval: Duration) {
        self.task.start_download(uri, RunOptions::with_interval(Some(interval)));
    }

    pub fn start_upload(&self, uri: &str, size: u64) {
        self.task.start_upload(uri, size, RunOptions::default());
    }

    pub fn start_upload_with_interval(&self, uri: &str, size: u64, interval: Duration) {
        self.task.start_upload(uri, size, RunOptions::with_interval(Some(interval)));
    }

    /// Download for at most `duration`, then complete with what was measured.
    pub fn start_fixed_download(&self, uri: &str, duration: Duration) {
        self.task.start_download(uri, RunOptions::fixed(duration, None));
    }

    pub fn start_fixed_download_with_interval(&self, uri: &str, duration: Duration, interval: Duration) {
        self.task.start_download(uri, RunOptions::fixed(duration, Some(interval)));
    }

    pub fn start_fixed_upload(&self, uri: &str, size: u64, duration: Duration) {
        self.task.start_upload(uri, size, RunOptions::fixed(duration, None));
    }

    pub fn start_fixed_upload_with_interval(
        &self,
        uri: &str,
        size: u64,
        duration: Duration,
        interval: Duration,
    ) {
        self.task.start_upload(uri, size, RunOptions::fixed(duration, Some(interval)));
    }

    // ── Repeat windows ──────────────────────────────────────────────────

    pub fn start_download_repeat(
        &self,
        uri: &str,
        window: Duration,
        report_interval: Option<Duration>,
        listener: Arc<dyn RepeatListener>,
    ) {
        self.repeat.start_download(uri, window, report_interval, listener);
    }

    pub fn start_upload_repeat(
        &self,
        uri: &str,
        window: Duration,
        report_interval: Option<Duration>,
        size: u64,
        listener: Arc<dyn RepeatListener>,
    ) {
        self.repeat.start_upload(uri, window, report_interval, size, listener);
    }

    // ── Control ─────────────────────────────────────────────────────────

    /// Stop the current transfer. An open repeat window ends with it and its
    /// listener hears nothing more.
    pub fn force_stop_task(&self) {
        self.repeat.cancel();
        self.task.force_stop_task();
    }

    pub fn close_socket(&self) {
        self.task.close_socket();
    }

    pub async fn shutdown_and_wait(&self) {
        self.task.shutdown_and_wait().await;
    }

    pub fn get_live_report(&self) -> SpeedTestReport {
        self.task.report()
    }

    // ── Configuration ───────────────────────────────────────────────────

    pub fn config(&self) -> SpeedTestConfig {
        self.config.read().clone()
    }

    pub fn set_socket_timeout(&self, timeout: Duration) {
        if !timeout.is_zero() {
            self.config.write().socket_timeout = timeout;
        }
    }

    pub fn socket_timeout(&self) -> Duration {
        self.config.read().socket_timeout
    }

    pub fn set_upload_chunk_size(&self, size: usize) {
        if size > 0 {
            self.config.write().upload_chunk_size = size;
        }
    }

    pub fn upload_chunk_size(&self) -> usize {
        self.config.read().upload_chunk_size
    }

    /// Route HTTP(S) through `proxy_url`. Returns false, leaving the current
    /// proxy in place, when the URL is unusable.
    pub fn set_proxy_server(&self, proxy_url: &str) -> bool {
        match ProxyServer::parse(proxy_url) {
            Some(proxy) => {
                self.config.write().proxy = Some(proxy);
                true
            }
            None => false,
        }
    }

    pub fn clear_proxy_server(&self) {
        self.config.write().proxy = None;
    }

    pub fn proxy_server(&self) -> Option<ProxyServer> {
        self.config.read().proxy.clone()
    }

    pub fn set_ftp_mode(&self, mode: FtpMode) {
        self.config.write().ftp_mode = mode;
    }

    pub fn ftp_mode(&self) -> FtpMode {
        self.config.read().ftp_mode
    }

    pub fn set_upload_storage_type(&self, storage: UploadStorageType) {
        self.config.write().upload_storage_type = storage;
    }

    pub fn upload_storage_type(&self) -> UploadStorageType {
        self.config.read().upload_storage_type
    }

    pub fn set_computation_method(&self, method: ComputationMethod) {
        self.config.write().computation_method = method;
    }

    pub fn computation_method(&self) -> ComputationMethod {
        self.config.read().computation_method
    }

    pub fn set_download_setup_time(&self, setup: Duration) {
        self.config.write().download_setup_time = setup;
    }

    pub fn download_setup_time(&self) -> Duration {
        self.config.read().download_setup_time
    }

    pub fn set_upload_setup_time(&self, setup: Duration) {
        self.config.write().upload_setup_time = setup;
    }

    pub fn upload_setup_time(&self) -> Duration {
        self.config.read().upload_setup_time
    }

    pub fn set_default_scale(&self, scale: u32) {
        self.config.write().scale = scale;
    }

    pub fn default_scale(&self) -> u32 {
        self.config.read().scale
    }

    pub fn set_default_rounding_mode(&self, mode: RoundingMode) {
        self.config.write().rounding_mode = mode;
    }

    pub fn default_rounding_mode(&self) -> RoundingMode {
        self.config.read().rounding_mode
    }

    pub fn set_logger(&self, logger: Arc<dyn TransferLogger>) {
        self.task.set_logger(logger);
    }
}

impl Default for SpeedTestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpeedTestClient {
    fn drop(&mut self) {
        self.repeat.cancel();
        self.task.close_socket();
    }
}
