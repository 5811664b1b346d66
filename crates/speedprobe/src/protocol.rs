/// Wire constants and request builders.
///
/// HTTP requests are written by hand as plain HTTP/1.1 text; only the
/// response head goes through a parser (see `http`).

use std::time::Duration;

use url::Url;

use crate::error::TaskError;

/// Read buffer for HTTP and FTP downloads.
pub const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;

/// Default upload write size.
pub const DEFAULT_UPLOAD_CHUNK: usize = 65535;

/// Write chunk used when filling a file-backed payload.
pub const PAYLOAD_FILE_CHUNK: usize = 64 * 1024;

/// 4 MB socket buffers for throughput.
pub const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Largest response head accepted before giving up.
pub const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Headers parsed per response.
pub const MAX_HEADERS: usize = 64;

/// Redirect hops followed before a response is rejected.
pub const MAX_REDIRECTS: u32 = 10;

/// Upper bound on waiting for a run to drain.
pub const SHUTDOWN_WAIT: Duration = Duration::from_millis(500);

pub const USER_AGENT: &str = concat!("speedprobe/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ftp,
}

impl Scheme {
    pub fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

/// Parse a caller URI and classify its scheme.
pub fn parse_uri(raw: &str) -> Result<(Url, Scheme), TaskError> {
    let url = Url::parse(raw.trim()).map_err(|e| TaskError::MalformedUri(format!("{raw}: {e}")))?;
    let scheme = scheme_of(&url)?;
    if url.host_str().is_none() {
        return Err(TaskError::MalformedUri(format!("{raw}: missing host")));
    }
    Ok((url, scheme))
}

pub fn scheme_of(url: &Url) -> Result<Scheme, TaskError> {
    match url.scheme() {
        "http" => Ok(Scheme::Http),
        "https" => Ok(Scheme::Https),
        "ftp" => Ok(Scheme::Ftp),
        other => Err(TaskError::UnsupportedProtocol(other.to_string())),
    }
}

/// Host and port to dial for `url`, with the scheme's default port.
pub fn endpoint(url: &Url) -> Result<(String, u16), TaskError> {
    let host = url
        .host_str()
        .ok_or_else(|| TaskError::MalformedUri(url.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TaskError::MalformedUri(url.to_string()))?;
    Ok((host, port))
}

/// `Host` header value: the port only appears when it is not the default.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Origin-form target, or the absolute URL when talking to a proxy directly.
pub fn request_target(url: &Url, absolute: bool) -> String {
    if absolute {
        let mut abs = url.clone();
        abs.set_fragment(None);
        return abs.to_string();
    }
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

pub fn download_request(url: &Url, via_proxy: bool) -> String {
    let mut req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\n",
        request_target(url, via_proxy),
        host_header(url),
        USER_AGENT,
    );
    if via_proxy {
        req.push_str("Proxy-Connection: Keep-Alive\r\n");
    }
    req.push_str("\r\n");
    req
}

pub fn upload_request_head(url: &Url, size: u64, via_proxy: bool) -> String {
    let mut req = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n",
        request_target(url, via_proxy),
        host_header(url),
        USER_AGENT,
        size,
    );
    if via_proxy {
        req.push_str("Proxy-Connection: Keep-Alive\r\n");
    }
    req.push_str("\r\n");
    req
}

/// Tunnel request sent to a proxy before the TLS handshake.
pub fn connect_request(host: &str, port: u16) -> String {
    format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: {USER_AGENT}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    )
}

/// Resolve a `Location` header against the URL that produced it.
///
/// An absolute path stays on the same host and port; anything else must be a
/// full URL.
pub fn resolve_location(base: &Url, location: &str) -> Result<Url, TaskError> {
    let location = location.trim();
    if location.starts_with('/') {
        return base
            .join(location)
            .map_err(|e| TaskError::MalformedUri(format!("{location}: {e}")));
    }
    Url::parse(location).map_err(|e| TaskError::MalformedUri(format!("{location}: {e}")))
}

pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 307)
}
