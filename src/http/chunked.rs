//! Chunked transfer encoding support
//!
//! Decodes a `Transfer-Encoding: chunked` body straight off the connection.
//! Each chunk is read with an exact-length body read, so the stream is left
//! positioned just after the trailer section and the connection can be
//! reused.

use super::framing::{read_line, BodyLength, BodyRead, BodyReader, CancelToken};
use super::{Error, HttpBody, Result};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData(usize),
    ChunkEnd,
    Trailer,
    Complete,
}

/// Parse a chunk-size line, ignoring chunk extensions.
fn parse_chunk_size(line: &str) -> Result<usize> {
    let size_str = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size_str, 16).map_err(|_| Error::InvalidChunkSize(size_str.to_string()))
}

/// Read a chunked body into `body`.
///
/// A malformed chunk-size line is an error. Running out of data inside a
/// chunk is treated like any other body read: the decoded prefix is kept
/// and the result is marked truncated.
pub fn read_chunked_body<R: Read + ?Sized>(
    reader: &mut R,
    body_reader: &mut BodyReader,
    body: &mut HttpBody,
    cancel: Option<&CancelToken>,
) -> Result<BodyRead> {
    let mut state = DecoderState::ChunkSize;
    let mut total = 0;

    let truncated = |bytes| BodyRead {
        bytes,
        truncated: true,
    };

    loop {
        state = match state {
            DecoderState::ChunkSize => match read_line(reader) {
                Ok(line) if line.trim().is_empty() => DecoderState::ChunkSize,
                Ok(line) => match parse_chunk_size(&line)? {
                    0 => DecoderState::Trailer,
                    n => DecoderState::ChunkData(n),
                },
                Err(e) => {
                    log::debug!("Chunked body ended early: {}", e);
                    return Ok(truncated(total));
                }
            },

            DecoderState::ChunkData(size) => {
                let read = body_reader.read_body(reader, BodyLength::Sized(size), body, cancel);
                total += read.bytes;
                if read.truncated {
                    return Ok(truncated(total));
                }
                DecoderState::ChunkEnd
            }

            DecoderState::ChunkEnd => match read_line(reader) {
                Ok(line) if line.is_empty() => DecoderState::ChunkSize,
                Ok(_) => return Err(Error::Protocol("Expected CRLF after chunk".to_string())),
                Err(_) => return Ok(truncated(total)),
            },

            DecoderState::Trailer => match read_line(reader) {
                Ok(line) if line.is_empty() => DecoderState::Complete,
                Ok(_) => DecoderState::Trailer,
                // Some servers close right after the last chunk.
                Err(_) => DecoderState::Complete,
            },

            DecoderState::Complete => {
                return Ok(BodyRead {
                    bytes: total,
                    truncated: false,
                })
            }
        };
    }
}
