//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameDecoder`] is the sans-IO core: it accumulates arbitrary byte chunks
//! and yields complete [`Message`]s, resynchronising after malformed frames
//! instead of giving up on the stream. [`FrameReader`] and [`FrameWriter`]
//! wrap it for async readers and writers.

use std::collections::VecDeque;
use std::io;

use lsprobe_types::{DecodeError, Message};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (64 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Maximum size of a header block before we give up looking for its end.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH: &[u8] = b"content-length";

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Incremental `Content-Length` frame decoder.
///
/// Message boundaries are independent of how bytes are chunked: feeding a
/// stream one byte at a time yields the same messages as feeding it whole.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Declared body length of the frame whose header has been consumed.
    body_len: Option<usize>,
    /// Bytes still to discard from an oversized frame.
    skip: usize,
    /// Discarding input until the next `Content-Length` header.
    resyncing: bool,
    header: HeaderScan,
}

enum Header {
    Incomplete,
    Complete { content_length: usize, consumed: usize },
    Invalid { reason: String, consumed: usize },
}

/// Progress through a header block that is still arriving, so complete lines
/// are parsed once however the block is chunked.
#[derive(Debug, Default)]
struct HeaderScan {
    /// Bytes of complete header lines already parsed.
    pos: usize,
    content_length: Option<usize>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every message they complete, in stream order.
    ///
    /// Errors are per-frame: the offending bytes are dropped and decoding
    /// continues with whatever follows.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Message, DecodeError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            if self.skip > 0 {
                let n = self.skip.min(self.buf.len());
                self.buf.drain(..n);
                self.skip -= n;
                if self.skip > 0 {
                    break;
                }
            }

            if self.resyncing && !self.resync() {
                break;
            }

            if let Some(len) = self.body_len {
                if self.buf.len() < len {
                    break;
                }
                let body: Vec<u8> = self.buf.drain(..len).collect();
                self.body_len = None;
                out.push(decode_body(&body));
                continue;
            }

            if self.header.pos == 0 {
                // Blank lines between frames.
                let blank = self
                    .buf
                    .iter()
                    .take_while(|&&b| b == b'\r' || b == b'\n')
                    .count();
                self.buf.drain(..blank);
            }

            match parse_header(&self.buf, &mut self.header) {
                Header::Incomplete => break,
                Header::Complete {
                    content_length,
                    consumed,
                } => {
                    self.buf.drain(..consumed);
                    if content_length > MAX_FRAME_BYTES {
                        self.skip = content_length;
                        out.push(Err(DecodeError::MalformedFrame(format!(
                            "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
                        ))));
                    } else {
                        self.body_len = Some(content_length);
                    }
                }
                Header::Invalid { reason, consumed } => {
                    tracing::trace!(reason = %reason, "discarding malformed frame header");
                    self.buf.drain(..consumed);
                    self.resyncing = true;
                    out.push(Err(DecodeError::MalformedFrame(reason)));
                }
            }
        }

        out
    }

    /// True while bytes of an unfinished frame are buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.body_len.is_some()
            || self.skip > 0
            || self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Drop bytes up to the next `Content-Length` header. Returns whether one was found.
    fn resync(&mut self) -> bool {
        let found = self
            .buf
            .windows(CONTENT_LENGTH.len())
            .position(|window| window.eq_ignore_ascii_case(CONTENT_LENGTH));
        if let Some(start) = found {
            self.buf.drain(..start);
            self.resyncing = false;
            true
        } else {
            // Keep a tail that could be the start of a split header name.
            let keep = CONTENT_LENGTH.len() - 1;
            if self.buf.len() > keep {
                let cut = self.buf.len() - keep;
                self.buf.drain(..cut);
            }
            false
        }
    }
}

/// Continue scanning the header block at the start of `buf`. `buf` must not
/// start with a blank line.
fn parse_header(buf: &[u8], scan: &mut HeaderScan) -> Header {
    loop {
        let Some(offset) = buf[scan.pos..].iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_HEADER_BYTES {
                return oversized_header(scan, buf.len());
            }
            return Header::Incomplete;
        };
        let next = scan.pos + offset + 1;
        if next > MAX_HEADER_BYTES {
            return oversized_header(scan, next);
        }
        let raw = &buf[scan.pos..next - 1];
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);

        if line.is_empty() {
            return match std::mem::take(scan).content_length {
                Some(content_length) => Header::Complete {
                    content_length,
                    consumed: next,
                },
                None => Header::Invalid {
                    reason: "missing Content-Length header".to_string(),
                    consumed: next,
                },
            };
        }

        match parse_header_line(line) {
            Ok(Some(len)) => scan.content_length = Some(len),
            Ok(None) => {}
            Err(reason) => {
                *scan = HeaderScan::default();
                return Header::Invalid {
                    reason,
                    consumed: next,
                };
            }
        }
        scan.pos = next;
    }
}

fn oversized_header(scan: &mut HeaderScan, consumed: usize) -> Header {
    *scan = HeaderScan::default();
    Header::Invalid {
        reason: format!("header block exceeds {MAX_HEADER_BYTES} bytes"),
        consumed,
    }
}

/// Parse one header line. Returns the length for `Content-Length`, `None` for
/// any other (ignored) header.
fn parse_header_line(line: &[u8]) -> Result<Option<usize>, String> {
    let text = std::str::from_utf8(line)
        .map_err(|_| "header line is not valid UTF-8".to_string())?;
    let Some((key, value)) = text.split_once(':') else {
        return Err(format!("unparsable header line: {text:?}"));
    };
    // Header names are case-insensitive.
    if !key.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    let value = value.trim();
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|_| format!("invalid Content-Length value: {value:?}"))
}

fn decode_body(body: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| DecodeError::MalformedFrame(format!("frame body is not valid JSON: {e}")))?;
    Message::from_value(value.clone())
        .map_err(|error| DecodeError::InvalidEnvelope { error, raw: value })
}

/// Serialize a message to its exact wire form.
#[must_use]
pub fn encode(message: &Message) -> Vec<u8> {
    frame(message.to_value().to_string().as_bytes())
}

/// Prefix an arbitrary body with a `Content-Length` header.
#[must_use]
pub fn frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A single bad frame. The stream is still usable.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Reads JSON-RPC messages from an async reader.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    ready: VecDeque<Result<Message, DecodeError>>,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            chunk: vec![0; READ_CHUNK_BYTES].into_boxed_slice(),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// EOF inside a frame is an `UnexpectedEof` I/O error.
    pub async fn read_message(&mut self) -> Result<Option<Message>, CodecError> {
        loop {
            if let Some(next) = self.ready.pop_front() {
                return next.map(Some).map_err(CodecError::from);
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.has_partial() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "EOF in the middle of a frame",
                    )
                    .into());
                }
                return Ok(None);
            }
            self.ready.extend(self.decoder.feed(&self.chunk[..n]));
        }
    }
}

/// Writes JSON-RPC messages to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a message with its `Content-Length` header.
    pub async fn write_message(&mut self, message: &Message) -> io::Result<()> {
        self.write_raw(&encode(message)).await
    }

    /// Write bytes verbatim. Used to inject hand-built or broken frames.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
