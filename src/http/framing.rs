//! Header framing and body reading off a raw stream
//!
//! The header block is read one byte at a time so that nothing past the
//! blank line is consumed: the next read on the same connection starts at
//! the body. Bodies are read through a reusable buffer, never past the
//! declared length, so a pipelined message that follows stays intact.

use super::{Error, HttpBody, Result, MAX_HEADER_BYTES};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default size of the reusable body read buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Read a header block up to and including its terminator.
///
/// Accepts both `\r\n\r\n` and bare `\n\n` terminators. Fails with
/// `Error::HeaderRead` when the stream ends first, and with `Error::Timeout`
/// when the socket read times out.
pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let mut header = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(Error::HeaderRead(format!(
                    "end of stream after {} header bytes",
                    header.len()
                )))
            }
            Ok(_) => {
                header.push(byte[0]);
                if header.ends_with(b"\n\n") || header.ends_with(b"\r\n\r\n") {
                    return Ok(String::from_utf8_lossy(&header).into_owned());
                }
                if header.len() > MAX_HEADER_BYTES {
                    return Err(Error::HeaderRead(format!(
                        "header exceeds {} bytes",
                        MAX_HEADER_BYTES
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(Error::Timeout),
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Read a single line (used for chunk-size lines and trailers).
///
/// The returned line excludes its `\n` / `\r\n` ending.
pub fn read_line<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let mut line = Vec::with_capacity(16);
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                line.push(byte[0]);
                if line.len() > MAX_HEADER_BYTES {
                    return Err(Error::Protocol("line too long".to_string()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(Error::Timeout),
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// How much body to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// Exactly this many bytes (0 means no read at all)
    Sized(usize),
    /// Everything until the peer closes the connection
    UntilClose,
}

impl BodyLength {
    /// Map the `-1` "read until close" sentinel used by declared lengths.
    pub fn from_declared(length: i64) -> Self {
        if length < 0 {
            BodyLength::UntilClose
        } else {
            BodyLength::Sized(length as usize)
        }
    }
}

/// Cooperative cancellation flag checked between body chunks and sends.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of a body read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyRead {
    /// Bytes appended during this call
    pub bytes: usize,
    /// Whether the read stopped before the expected end (I/O error, EOF
    /// inside a sized body, or cancellation)
    pub truncated: bool,
}

/// Body reader with a reusable buffer
///
/// One reader belongs to one connection; its buffer contents are
/// meaningless between calls.
pub struct BodyReader {
    buffer: Vec<u8>,
}

impl BodyReader {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(size: usize) -> Self {
        BodyReader {
            buffer: vec![0u8; size.max(1)],
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Append a body of the given length to `body`.
    ///
    /// I/O errors and timeouts end the read without failing: whatever was
    /// accumulated stays in `body` and the result is marked truncated.
    pub fn read_body<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        length: BodyLength,
        body: &mut HttpBody,
        cancel: Option<&CancelToken>,
    ) -> BodyRead {
        let mut total = 0;

        let remaining = match length {
            BodyLength::Sized(0) => {
                return BodyRead {
                    bytes: 0,
                    truncated: false,
                }
            }
            BodyLength::Sized(n) => Some(n),
            BodyLength::UntilClose => None,
        };

        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                log::debug!("Body read cancelled after {} bytes", total);
                return BodyRead {
                    bytes: total,
                    truncated: true,
                };
            }

            let want = match remaining {
                Some(n) if total >= n => break,
                Some(n) => (n - total).min(self.buffer.len()),
                None => self.buffer.len(),
            };

            match reader.read(&mut self.buffer[..want]) {
                Ok(0) => {
                    let truncated = remaining.is_some();
                    if truncated {
                        log::debug!(
                            "Connection closed after {} of {:?} body bytes",
                            total,
                            remaining
                        );
                    }
                    return BodyRead {
                        bytes: total,
                        truncated,
                    };
                }
                Ok(n) => {
                    body.append(&self.buffer[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Body read stopped after {} bytes: {}", total, e);
                    return BodyRead {
                        bytes: total,
                        truncated: true,
                    };
                }
            }
        }

        BodyRead {
            bytes: total,
            truncated: false,
        }
    }
}

impl Default for BodyReader {
    fn default() -> Self {
        Self::new()
    }
}
