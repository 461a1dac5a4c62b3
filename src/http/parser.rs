//! HTTP header block parsing
//!
//! Turns a framed header block (as returned by `framing::read_header`) into
//! its first line and field lines. Both CRLF and bare LF line endings are
//! accepted.

use super::{Error, Headers, Method, Result, Status, Version};

/// Parse HTTP request line
///
/// Format: METHOD URI VERSION
/// Example: GET /index.html HTTP/1.1
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }

    let method = parts[0].parse::<Method>()?;
    let uri = parts[1].to_string();
    let version = parts[2].parse::<Version>()?;

    Ok((method, uri, version))
}

/// Parse HTTP response status line
///
/// Format: VERSION STATUS REASON
/// Example: HTTP/1.1 200 OK
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.trim().splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!(
            "Invalid status line: expected at least 2 parts, got {}",
            parts.len()
        )));
    }

    let version = parts[0].parse::<Version>()?;
    let status_code = parts[1]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
    let status = Status::new(status_code)?;
    let reason = if parts.len() == 3 {
        parts[2].trim().to_string()
    } else {
        status.reason_phrase().to_string()
    };

    Ok((version, status, reason))
}

/// Split a header block into its first line and parsed fields.
fn split_block(block: &str) -> Result<(&str, Headers)> {
    let mut lines = block
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));

    let first = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| Error::Parse("Empty header block".to_string()))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = Headers::parse_header_line(line)?;
        headers.insert(name, value);
    }

    Ok((first, headers))
}

/// Parsed response status line and header fields
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    pub reason: String,
    pub headers: Headers,
}

/// Parse a framed response header block
pub fn parse_response_head(block: &str) -> Result<ResponseHead> {
    let (first, headers) = split_block(block)?;
    let (version, status, reason) = parse_status_line(first)?;
    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

/// Parsed request line and header fields
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

/// Parse a framed request header block
pub fn parse_request_head(block: &str) -> Result<RequestHead> {
    let (first, headers) = split_block(block)?;
    let (method, target, version) = parse_request_line(first)?;
    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}
