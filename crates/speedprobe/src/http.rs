/// HTTP/1.1 response-head parsing.
///
/// Reads from the stream until a complete head is buffered, then hands the
/// bytes to `httparse`. Any body bytes that arrived with the head stay in the
/// buffer for the caller.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TaskError;
use crate::protocol::{MAX_HEADERS, MAX_RESPONSE_HEAD};

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    /// Bytes of the buffer taken by the head.
    pub head_len: usize,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    /// 200 with reason `OK` or no reason at all.
    pub fn is_ok(&self) -> bool {
        self.status == 200 && (self.reason.is_empty() || self.reason.eq_ignore_ascii_case("ok"))
    }
}

/// Parse a head from `buf`. `Ok(None)` means more bytes are needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<ResponseHead>, TaskError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let head_len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(TaskError::invalid_response(0, e.to_string())),
    };

    let status = resp.code.unwrap_or(0);
    let reason = resp.reason.unwrap_or("").trim().to_string();
    let headers: Vec<(String, String)> = resp
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<u64>().ok());

    Ok(Some(ResponseHead {
        status,
        reason,
        headers,
        content_length,
        head_len,
    }))
}

/// Read until a full response head is in `buf`, then split it off.
///
/// Each read is bounded by `read_timeout`.
pub async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> Result<ResponseHead, TaskError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(head) = parse_head(buf)? {
            let _ = buf.split_to(head.head_len);
            return Ok(head);
        }
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(TaskError::invalid_response(0, "response head too large"));
        }
        buf.reserve(4096);
        let n = tokio::time::timeout(read_timeout, stream.read_buf(buf))
            .await
            .map_err(|_| TaskError::Timeout(read_timeout))??;
        if n == 0 {
            return Err(TaskError::Connection("connection closed before response head".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\nX-Test: yes\r\n\r\nbody";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert!(head.is_ok());
        assert_eq!(head.content_length, Some(42));
        assert_eq!(head.header("x-test"), Some("yes"));
        assert_eq!(&raw[head.head_len..], b"body");
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(parse_head(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap().is_none());
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            parse_head(b"NOT HTTP AT ALL\r\n\r\n"),
            Err(TaskError::InvalidHttpResponse { status: 0, .. })
        ));
    }

    #[test]
    fn reason_must_be_ok_or_empty() {
        let head = parse_head(b"HTTP/1.1 200 \r\n\r\n").unwrap().unwrap();
        assert!(head.is_ok());
        let head = parse_head(b"HTTP/1.1 200 Fine\r\n\r\n").unwrap().unwrap();
        assert!(!head.is_ok());
    }

    #[tokio::test]
    async fn reads_head_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"HTTP/1.1 302 Found\r\n").await.unwrap();
            server.write_all(b"Location: /file/5\r\n\r\nxy").await.unwrap();
        });
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut client, &mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(head.status, 302);
        assert_eq!(head.location(), Some("/file/5"));
        assert_eq!(&buf[..], b"xy");
    }
}
