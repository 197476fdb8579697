use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

// RFC 7230 - HTTP/1.1 Message Syntax and Routing

pub const MAX_HEADERS: usize = 100;
pub const MAX_LINE_BYTES: usize = 8 * 1024;
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Reads one CRLF- (or bare-LF-) terminated line, excluding the terminator.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProxyError::Closed)
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_LINE_BYTES {
            return Err(ProxyError::ParseHeader);
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Reads header lines until the blank line. Names are normalised to
/// lower-case (RFC 7230 Section 3.2); field lines without a colon are
/// tolerated and skipped.
pub async fn read_headers<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for _ in 0..=MAX_HEADERS {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Err(ProxyError::ParseHeader)
}

/// Reads a message body according to its framing headers: exact
/// `Content-Length`, chunked transfer coding, or none. Bounded by
/// `MAX_BODY_BYTES` in every mode.
pub async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    headers: &HashMap<String, String>,
) -> Result<Vec<u8>> {
    if let Some(raw_length) = headers.get("content-length") {
        let length: usize = raw_length
            .trim()
            .parse()
            .map_err(|_| ProxyError::ParseBody("content-length is not a number"))?;
        if length > MAX_BODY_BYTES {
            return Err(ProxyError::ParseBody("declared body exceeds limit"));
        }
        let mut body = vec![0u8; length];
        read_exact(reader, &mut body).await?;
        return Ok(body);
    }

    let chunked = headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return read_chunked_body(reader).await;
    }

    Ok(Vec::new())
}

// RFC 7230 Section 4.1 - chunked transfer coding
async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(reader).await?;
        // Chunk extensions after ';' are ignored.
        let size_token = size_line
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let chunk_size = usize::from_str_radix(size_token, 16)
            .map_err(|_| ProxyError::ParseFraming("chunked"))?;

        if chunk_size == 0 {
            // Trailing CRLF after the zero chunk; trailers are not supported.
            let trailer = read_line(reader).await?;
            if !trailer.is_empty() {
                return Err(ProxyError::ParseFraming("chunked"));
            }
            return Ok(body);
        }

        if body.len() + chunk_size > MAX_BODY_BYTES {
            return Err(ProxyError::ParseBody("chunked body exceeds limit"));
        }

        let start = body.len();
        body.resize(start + chunk_size, 0);
        read_exact(reader, &mut body[start..]).await?;

        let crlf = read_line(reader).await?;
        if !crlf.is_empty() {
            return Err(ProxyError::ParseFraming("chunked"));
        }
    }
}

async fn read_exact<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProxyError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Parses a full request: request line, headers, body.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HttpRequest> {
    // RFC 7230 Section 3.1.1 - request line, single-space separated
    let request_line = read_line(reader).await?;
    let parts: Vec<&str> = request_line.split(' ').collect();
    if parts.len() < 3 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ProxyError::ParseRequestLine(request_line.clone()));
    }

    let method = parts[0].to_string();
    let target = parts[1].to_string();
    let version = parts[2].to_string();

    let headers = read_headers(reader).await?;
    let body = read_body(reader, &headers).await?;

    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    })
}

/// Parses a full response: status line, headers, body.
pub async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HttpResponse> {
    // RFC 7230 Section 3.1.2 - status line
    let status_line = read_line(reader).await?;
    let parts: Vec<&str> = status_line.split(' ').collect();
    if parts.len() < 3 {
        return Err(ProxyError::ParseFraming("status line"));
    }

    let version = parts[0].to_string();
    let status: u16 = parts[1]
        .parse()
        .map_err(|_| ProxyError::ParseFraming("status line"))?;
    let reason = parts[2..].join(" ");

    let headers = read_headers(reader).await?;
    let body = read_body(reader, &headers).await?;

    Ok(HttpResponse {
        version,
        status,
        reason,
        headers,
        body,
    })
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Serialises a response for the client. `Content-Length` is always
/// rewritten to the size of the body actually served, and any upstream
/// transfer coding is dropped because the body is sent as one piece.
pub fn serialize_response(response: &HttpResponse) -> Vec<u8> {
    let mut head = format!(
        "{} {} {}\r\n",
        response.version, response.status, response.reason
    );
    for (name, value) in &response.headers {
        if name == "content-length" || name == "transfer-encoding" {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("content-length: {}\r\n\r\n", response.body.len()));

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&response.body);
    bytes
}

/// A headers-only response with an empty body, for error replies.
pub fn simple_response(status: u16) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status,
        status_text(status)
    )
    .into_bytes()
}
