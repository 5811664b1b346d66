/// Client configuration.
///
/// Defaults suit a typical speed test; `from_env` overlays `SPEEDPROBE_*`
/// variables the same way the server binaries read their settings.

use std::time::Duration;

use speedprobe_types::{ComputationMethod, FtpMode, RoundingMode, UploadStorageType};
use url::Url;

use crate::protocol::DEFAULT_UPLOAD_CHUNK;

/// HTTP proxy every HTTP(S) request is routed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
}

impl ProxyServer {
    /// Accepts `http://host:port` (port defaults to 80). Returns `None` for
    /// anything that does not name a host.
    pub fn parse(raw: &str) -> Option<Self> {
        let url = Url::parse(raw).ok()?;
        if url.scheme() != "http" {
            return None;
        }
        let host = url.host_str()?.to_string();
        Some(Self {
            host,
            port: url.port_or_known_default().unwrap_or(80),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SpeedTestConfig {
    pub socket_timeout: Duration,
    pub upload_chunk_size: usize,
    /// Decimal places kept on computed rates.
    pub scale: u32,
    pub rounding_mode: RoundingMode,
    pub ftp_mode: FtpMode,
    pub upload_storage_type: UploadStorageType,
    pub proxy: Option<ProxyServer>,
    pub download_setup_time: Duration,
    pub upload_setup_time: Duration,
    pub computation_method: ComputationMethod,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(10),
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK,
            scale: 4,
            rounding_mode: RoundingMode::HalfEven,
            ftp_mode: FtpMode::Passive,
            upload_storage_type: UploadStorageType::Ram,
            proxy: None,
            download_setup_time: Duration::ZERO,
            upload_setup_time: Duration::ZERO,
            computation_method: ComputationMethod::MedianAllTime,
        }
    }
}

impl SpeedTestConfig {
    /// Defaults overlaid with any `SPEEDPROBE_*` variables that parse.
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("SPEEDPROBE_SOCKET_TIMEOUT_MS") {
            config.socket_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>("SPEEDPROBE_UPLOAD_CHUNK_SIZE") {
            if size > 0 {
                config.upload_chunk_size = size;
            }
        }
        if let Some(scale) = env_parse("SPEEDPROBE_SCALE") {
            config.scale = scale;
        }
        if let Some(mode) = env_parse("SPEEDPROBE_ROUNDING_MODE") {
            config.rounding_mode = mode;
        }
        if let Some(mode) = env_parse("SPEEDPROBE_FTP_MODE") {
            config.ftp_mode = mode;
        }
        if let Some(storage) = env_parse("SPEEDPROBE_UPLOAD_STORAGE") {
            config.upload_storage_type = storage;
        }
        if let Some(method) = env_parse("SPEEDPROBE_COMPUTATION_METHOD") {
            config.computation_method = method;
        }
        if let Some(ms) = env_parse::<u64>("SPEEDPROBE_DOWNLOAD_SETUP_MS") {
            config.download_setup_time = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SPEEDPROBE_UPLOAD_SETUP_MS") {
            config.upload_setup_time = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("SPEEDPROBE_PROXY") {
            match ProxyServer::parse(&raw) {
                Some(proxy) => config.proxy = Some(proxy),
                None => tracing::warn!(value = %raw, "ignoring invalid SPEEDPROBE_PROXY"),
            }
        }

        config
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, "ignoring invalid setting: {}", e);
            None
        }
    }
}
