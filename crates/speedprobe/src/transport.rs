/// Socket setup: direct or proxied TCP, optional TLS.
///
/// Every connect, read and write here is bounded by the configured socket
/// timeout so a silent peer surfaces as `TaskError::Timeout`.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::config::ProxyServer;
use crate::error::TaskError;
use crate::http;
use crate::protocol::{self, SOCKET_BUF_SIZE, Scheme};

/// A connected byte stream, plain or TLS.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    pub fn peer_addr(&self) -> Option<String> {
        let tcp = match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref().0,
        };
        tcp.peer_addr().ok().map(|a| a.to_string())
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An open HTTP connection and how requests on it must be framed.
pub struct HttpConnection {
    pub stream: Connection,
    /// True when requests go straight to a proxy and need the absolute form.
    pub via_proxy: bool,
}

/// Open a TCP connection with the socket timeout and throughput options.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TaskError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TaskError::Timeout(timeout))?
        .map_err(|e| TaskError::Connection(format!("{host}:{port}: {e}")))?;

    let sock_ref = socket2::SockRef::from(&stream);
    if let Err(e) = sock_ref
        .set_nodelay(true)
        .and_then(|_| sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE))
        .and_then(|_| sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE))
    {
        warn!("socket tuning failed for {}:{}: {}", host, port, e);
    }
    Ok(stream)
}

/// Connect for an HTTP(S) request, through `proxy` when one is set.
pub async fn connect_http(
    host: &str,
    port: u16,
    scheme: Scheme,
    proxy: Option<&ProxyServer>,
    timeout: Duration,
) -> Result<HttpConnection, TaskError> {
    let tcp = match proxy {
        Some(proxy) => {
            let mut tcp = dial(&proxy.host, proxy.port, timeout).await?;
            if scheme == Scheme::Https {
                open_tunnel(&mut tcp, host, port, timeout).await?;
            }
            tcp
        }
        None => dial(host, port, timeout).await?,
    };

    let stream = match scheme {
        Scheme::Https => Connection::Tls(Box::new(tls_handshake(tcp, host, timeout).await?)),
        _ => Connection::Plain(tcp),
    };
    Ok(HttpConnection {
        stream,
        via_proxy: proxy.is_some() && scheme == Scheme::Http,
    })
}

async fn open_tunnel(
    tcp: &mut TcpStream,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(), TaskError> {
    debug!("opening proxy tunnel to {}:{}", host, port);
    write_all(tcp, protocol::connect_request(host, port).as_bytes(), timeout).await?;
    let mut buf = BytesMut::with_capacity(1024);
    let head = http::read_response_head(tcp, &mut buf, timeout).await?;
    if head.status != 200 {
        return Err(TaskError::invalid_response(head.status, head.reason));
    }
    Ok(())
}

async fn tls_handshake(
    tcp: TcpStream,
    host: &str,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, TaskError> {
    let connector = TlsConnector::from(tls_config()?);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TaskError::MalformedUri(format!("{host}: {e}")))?;
    tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TaskError::Timeout(timeout))?
        .map_err(|e| TaskError::Connection(format!("TLS handshake failed: {e}")))
}

fn tls_config() -> Result<Arc<ClientConfig>, TaskError> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TaskError::Connection(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

// ── Timed IO ────────────────────────────────────────────────────────────

pub async fn write_all<S>(stream: &mut S, data: &[u8], timeout: Duration) -> Result<(), TaskError>
where
    S: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, stream.write_all(data))
        .await
        .map_err(|_| TaskError::Timeout(timeout))??;
    Ok(())
}

pub async fn read_some<S>(stream: &mut S, buf: &mut [u8], timeout: Duration) -> Result<usize, TaskError>
where
    S: AsyncRead + Unpin,
{
    let n = tokio::time::timeout(timeout, stream.read(buf))
        .await
        .map_err(|_| TaskError::Timeout(timeout))??;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = dial("127.0.0.1", port, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, TaskError::Connection(_)));
    }

    #[tokio::test]
    async fn read_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut stream = dial("127.0.0.1", addr.port(), Duration::from_secs(2)).await.unwrap();
        let _peer = accept.await.unwrap();
        let mut buf = [0u8; 16];
        let err = read_some(&mut stream, &mut buf, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TaskError::Timeout(_)));
    }

    #[tokio::test]
    async fn proxied_plain_http_uses_absolute_form() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = ProxyServer {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
        };
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let conn = connect_http("origin.test", 80, Scheme::Http, Some(&proxy), Duration::from_secs(2))
            .await
            .unwrap();
        let _peer = accept.await.unwrap();
        assert!(conn.via_proxy);
    }

    /// Proxy that records the tunnel request head and refuses it.
    async fn refusing_proxy() -> (ProxyServer, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = ProxyServer {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
        };
        let handle = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                peer.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            peer.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });
        (proxy, handle)
    }

    #[tokio::test]
    async fn https_through_proxy_opens_connect_tunnel() {
        let (proxy, handle) = refusing_proxy().await;
        let result = connect_http("origin.test", 8443, Scheme::Https, Some(&proxy), Duration::from_secs(2)).await;

        let head = handle.await.unwrap();
        assert!(head.starts_with("CONNECT origin.test:8443 HTTP/1.1\r\n"), "{head}");
        assert!(head.contains("Host: origin.test:8443\r\n"));

        match result {
            Err(err @ TaskError::InvalidHttpResponse { status: 407, .. }) => {
                assert_eq!(err.kind(), speedprobe_types::SpeedTestError::InvalidHttpResponse);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("tunnel refused by the proxy was accepted"),
        }
    }
}
