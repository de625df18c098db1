//! Minimal HTTP/1.1 plumbing for the client side of the proxy.
//!
//! The listener reads the request head itself instead of handing the socket
//! to an HTTP server framework: CONNECT needs the raw connection back
//! after writing a fixed status line, and the plain path needs the header
//! lines in their original order and casing.

use crate::error::{ProxyError, Result};
use crate::headers::HeaderSet;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};

/// Maximum total size of HTTP headers (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum request body size (16 MiB).
pub const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Parsed request line and header lines, exactly as the client sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target: absolute URL for plain requests, `host:port` for CONNECT
    pub target: String,
    pub version: String,
    /// Header lines in arrival order, original casing
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Header pairs as borrowed strings, in arrival order.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// First value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Read a request head from the client.
///
/// Returns `Ok(None)` if the client disconnected before sending anything.
/// Bytes past the blank line stay in the reader's buffer.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut first_line = String::new();
    if reader.read_line(&mut first_line).await? == 0 {
        return Ok(None);
    }
    let mut total = first_line.len();
    let (method, target, version) = parse_request_line(first_line.trim_end())?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        total = total.saturating_add(n);
        if total > MAX_HEADER_SIZE {
            return Err(ProxyError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE,
            });
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ProxyError::HttpParse(format!("malformed header line: {}", line.trim_end()))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

/// Parse an HTTP request line into (method, target, version).
fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        )));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}

/// Parse the `host:port` target of a CONNECT request.
///
/// Defaults to port 443 when none is given. IPv6 literals may be bracketed.
pub fn parse_connect_target(authority: &str) -> Result<(String, u16)> {
    if authority.is_empty() {
        return Err(ProxyError::HttpParse("empty CONNECT target".to_string()));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.ends_with(':') => {
            let port = port_str.parse::<u16>().map_err(|_| {
                ProxyError::HttpParse(format!("invalid port in CONNECT: {}", authority))
            })?;
            (host, port)
        }
        _ => (authority, 443),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::HttpParse(format!(
            "missing host in CONNECT: {}",
            authority
        )));
    }
    Ok((host.to_string(), port))
}

/// Read the request body announced by the head.
///
/// Supports `Content-Length` and chunked transfer coding; chunked bodies are
/// returned decoded. Bodies over [`MAX_REQUEST_BODY`] are rejected.
pub async fn read_body<R>(reader: &mut R, head: &RequestHead) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let chunked = head
        .header("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return read_chunked_body(reader).await;
    }

    let Some(length) = head.header("content-length") else {
        return Ok(Vec::new());
    };
    let length: usize = length
        .parse()
        .map_err(|_| ProxyError::HttpParse(format!("invalid Content-Length: {}", length)))?;
    if length > MAX_REQUEST_BODY {
        return Err(ProxyError::BodyTooLarge {
            limit: MAX_REQUEST_BODY,
        });
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).await? == 0 {
            return Err(ProxyError::HttpParse(
                "connection closed inside chunked body".to_string(),
            ));
        }
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::HttpParse(format!("invalid chunk size: {}", size_str)))?;

        if size == 0 {
            // Trailer section ends at the first blank line.
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer).await?;
                if n == 0 || trailer.trim().is_empty() {
                    return Ok(body);
                }
            }
        }

        if body.len().saturating_add(size) > MAX_REQUEST_BODY {
            return Err(ProxyError::BodyTooLarge {
                limit: MAX_REQUEST_BODY,
            });
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(ProxyError::HttpParse("missing CRLF after chunk".to_string()));
        }
    }
}

/// Standard reason phrase for a status code.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    hyper::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Write a complete response with a small text body and close semantics.
pub async fn send_status<W>(
    writer: &mut W,
    status: u16,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a status line and headers. The caller frames the body.
pub async fn write_response_head<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    headers: &HeaderSet,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers.iter() {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one chunk in chunked transfer coding. Empty data is skipped, since
/// a zero-length chunk would end the body.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Terminate a chunked body.
pub async fn finish_chunks<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"0\r\n\r\n").await?;
    Ok(())
}

/// Resolve once the client's read side reports EOF or an error.
///
/// Bytes arriving after the request (pipelining) are discarded: every
/// exchange ends with `Connection: close`.
pub async fn client_closed<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// Resolve once the client's read side reports EOF or an error, keeping
/// whatever it sends meanwhile in `pending`.
///
/// Past `limit` buffered bytes the watch stops and this never resolves.
/// Cancel-safe: every byte read has been appended before the next await.
pub async fn hold_until_closed<R>(reader: &mut R, pending: &mut Vec<u8>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    while pending.len() < limit {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
    std::future::pending::<()>().await;
}
