//! Client-side HTTP/1.1 response reading. The donor's `http::request` parser is
//! purpose-built for reading *requests* server-side (table-driven, method-first);
//! a client reads a status line instead, so this is a separate, much smaller
//! reader built directly on [`SocketStream`], reusing only the chunked-body and
//! gzip/deflate-inflate logic shape described for the server's request body.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder};

use crate::{http::types::Method, stream::SocketStream};

const MAX_HEADER_SECTION: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum ResponseReadError {
    PeerClosed,
    Io,
    Malformed(String),
}

impl From<crate::errors::Error> for ResponseReadError {
    fn from(_: crate::errors::Error) -> Self {
        ResponseReadError::Io
    }
}

#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Whether the connection should be closed after this response, derived from
    /// `Connection: close` (or its absence on HTTP/1.0).
    pub close: bool,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn build_request(method: Method, path: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + body.len());
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !body.is_empty() && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Reads until the blank line ending the header section, returning the header
/// bytes (without the trailing `\r\n\r\n`) and any body bytes already read past it
/// in the same socket read (pipelining/pre-buffering).
async fn read_until_header_end(stream: &mut SocketStream) -> Result<(Vec<u8>, Vec<u8>), ResponseReadError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(pos) = memchr::memmem::find(&buf, b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            buf.truncate(pos);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEADER_SECTION {
            return Err(ResponseReadError::Malformed("header section too large".to_string()));
        }
        let n = stream.read_some(&mut chunk).await.map_err(|_| ResponseReadError::Io)?;
        if n == 0 {
            return Err(ResponseReadError::PeerClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub async fn read_response(stream: &mut SocketStream) -> Result<ClientResponse, ResponseReadError> {
    let (header_section, mut leftover) = read_until_header_end(stream).await?;

    let mut lines = header_section.split(|&b| b == b'\n').map(|l| {
        let l = if l.ends_with(b"\r") { &l[..l.len() - 1] } else { l };
        l
    });

    let status_line = lines
        .next()
        .ok_or_else(|| ResponseReadError::Malformed("missing status line".to_string()))?;
    let status_str = std::str::from_utf8(status_line).map_err(|_| ResponseReadError::Malformed("non-utf8 status line".to_string()))?;
    let mut parts = status_str.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ResponseReadError::Malformed("bad status code".to_string()))?;
    let reason = parts.next().unwrap_or("").to_string();
    let is_http10 = version == "HTTP/1.0";

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let line_str = std::str::from_utf8(line).map_err(|_| ResponseReadError::Malformed("non-utf8 header".to_string()))?;
        let Some((name, value)) = line_str.split_once(':') else {
            return Err(ResponseReadError::Malformed(format!("malformed header line: {line_str}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let get = |name: &str| headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone());

    let close = match get("connection") {
        Some(v) => v.eq_ignore_ascii_case("close"),
        None => is_http10,
    };

    let chunked = get("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    let content_length: Option<usize> = get("content-length").and_then(|v| v.parse().ok());

    let mut body = Vec::new();
    if chunked {
        body = read_chunked_body(stream, &mut leftover).await?;
    } else if let Some(len) = content_length {
        body = read_exact_body(stream, &mut leftover, len).await?;
    } else if close {
        body.append(&mut leftover);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = stream.read_some(&mut chunk).await.map_err(|_| ResponseReadError::Io)?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    if let Some(encoding) = get("content-encoding") {
        body = inflate(&encoding, &body)?;
    }

    Ok(ClientResponse {
        status,
        reason,
        headers,
        body,
        close,
    })
}

async fn read_exact_body(
    stream: &mut SocketStream,
    leftover: &mut Vec<u8>,
    len: usize,
) -> Result<Vec<u8>, ResponseReadError> {
    if leftover.len() >= len {
        let tail = leftover.split_off(len);
        let body = std::mem::replace(leftover, tail);
        return Ok(body);
    }
    let mut body = std::mem::take(leftover);
    let remaining = len - body.len();
    let mut buf = vec![0u8; remaining];
    stream.read_fix_size(&mut buf).await.map_err(|_| ResponseReadError::Io)?;
    body.extend_from_slice(&buf);
    Ok(body)
}

async fn read_chunked_body(stream: &mut SocketStream, leftover: &mut Vec<u8>) -> Result<Vec<u8>, ResponseReadError> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream, leftover).await?;
        let size_str = std::str::from_utf8(&size_line).map_err(|_| ResponseReadError::Malformed("bad chunk size".to_string()))?;
        let size = usize::from_str_radix(size_str.trim(), 16)
            .map_err(|_| ResponseReadError::Malformed(format!("bad chunk size: {size_str}")))?;
        if size == 0 {
            let _ = read_line(stream, leftover).await?; // trailing CRLF
            break;
        }
        let chunk = read_exact_body(stream, leftover, size).await?;
        body.extend_from_slice(&chunk);
        let _ = read_line(stream, leftover).await?; // CRLF after chunk data
    }
    Ok(body)
}

async fn read_line(stream: &mut SocketStream, leftover: &mut Vec<u8>) -> Result<Vec<u8>, ResponseReadError> {
    loop {
        if let Some(pos) = memchr::memchr(b'\n', leftover) {
            let mut line = leftover.drain(..=pos).collect::<Vec<u8>>();
            line.pop(); // '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read_some(&mut chunk).await.map_err(|_| ResponseReadError::Io)?;
        if n == 0 {
            return Err(ResponseReadError::PeerClosed);
        }
        leftover.extend_from_slice(&chunk[..n]);
    }
}

fn inflate(encoding: &str, body: &[u8]) -> Result<Vec<u8>, ResponseReadError> {
    let mut out = Vec::new();
    if encoding.eq_ignore_ascii_case("gzip") {
        GzDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(|e| ResponseReadError::Malformed(format!("gzip inflate failed: {e}")))?;
    } else if encoding.eq_ignore_ascii_case("deflate") {
        DeflateDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(|e| ResponseReadError::Malformed(format!("deflate inflate failed: {e}")))?;
    } else {
        return Ok(body.to_vec());
    }
    Ok(out)
}
