use axum::{
    body::Body,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, warn};

/// Download chunk size.
const CHUNK: usize = 64 * 1024;

static ZEROS: [u8; CHUNK] = [0u8; CHUNK];

/// GET /file/{size}: `size` bytes with a Content-Length.
pub async fn download(Path(size): Path<u64>) -> Response {
    debug!("serving {} bytes", size);
    let body = Body::from_stream(filler(size));

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/octet-stream".parse().unwrap());
    headers.insert(header::CONTENT_LENGTH, size.to_string().parse().unwrap());
    (StatusCode::OK, headers, body).into_response()
}

/// GET /chunked/{size}: same bytes, chunked encoding, no Content-Length.
pub async fn download_chunked(Path(size): Path<u64>) -> Response {
    (StatusCode::OK, Body::from_stream(filler(size))).into_response()
}

fn filler(size: u64) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let mut remaining = size;
        while remaining > 0 {
            let n = (remaining as usize).min(CHUNK);
            remaining -= n as u64;
            yield Ok::<Bytes, std::io::Error>(Bytes::from_static(&ZEROS[..n]));
        }
    }
}

/// POST /upload: drain the body and report how much arrived.
pub async fn upload(body: Body) -> Response {
    match drain(body).await {
        Ok(total) => (StatusCode::OK, total.to_string()).into_response(),
        Err(status) => status.into_response(),
    }
}

/// GET /redirect/{size} → /file/{size}
pub async fn redirect_download(Path(size): Path<u64>) -> Response {
    redirect(StatusCode::FOUND, &format!("/file/{size}"))
}

/// POST /redirect-upload → /upload, after reading the body.
pub async fn redirect_upload(body: Body) -> Response {
    if let Err(status) = drain(body).await {
        return status.into_response();
    }
    redirect(StatusCode::TEMPORARY_REDIRECT, "/upload")
}

/// POST /redirect-secure → an https location, after reading the body.
pub async fn redirect_secure(headers: HeaderMap, body: Body) -> Response {
    if let Err(status) = drain(body).await {
        return status.into_response();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    redirect(StatusCode::TEMPORARY_REDIRECT, &format!("https://{host}/upload"))
}

pub async fn health() -> &'static str {
    "ok"
}

fn redirect(status: StatusCode, location: &str) -> Response {
    let mut headers = HeaderMap::new();
    match location.parse() {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
        }
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
    (status, headers).into_response()
}

async fn drain(body: Body) -> Result<u64, StatusCode> {
    let mut stream = body.into_data_stream();
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => total += bytes.len() as u64,
            Err(e) => {
                warn!("upload body error after {} bytes: {}", total, e);
                return Err(StatusCode::BAD_REQUEST);
            }
        }
    }
    debug!("drained {} bytes", total);
    Ok(total)
}
