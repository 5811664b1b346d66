//! Reference server for speed tests: sized downloads, an upload sink and a
//! few redirect routes.

pub mod routes;

use std::net::SocketAddr;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub fn router() -> Router {
    Router::new()
        .route("/file/{size}", get(routes::download))
        .route("/chunked/{size}", get(routes::download_chunked))
        .route("/upload", post(routes::upload))
        .route("/redirect/{size}", get(routes::redirect_download))
        .route("/redirect-upload", post(routes::redirect_upload))
        .route("/redirect-secure", post(routes::redirect_secure))
        .route("/health", get(routes::health))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve in the background. Returns the bound address, so
/// port 0 works for tests.
pub async fn spawn(addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router()).await {
            tracing::error!("speedprobe server stopped: {}", e);
        }
    });
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn file_route_sets_content_length() {
        let addr = spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let resp = raw_request(addr, "GET /file/10 HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.to_ascii_lowercase().contains("content-length: 10\r\n"));
    }

    #[tokio::test]
    async fn redirect_route_points_at_file() {
        let addr = spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let resp = raw_request(addr, "GET /redirect/7 HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(resp.to_ascii_lowercase().contains("location: /file/7\r\n"));
    }

    #[tokio::test]
    async fn upload_route_counts_body() {
        let addr = spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let resp = raw_request(
            addr,
            "POST /upload HTTP/1.1\r\nHost: test\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.ends_with("5"));
    }
}
