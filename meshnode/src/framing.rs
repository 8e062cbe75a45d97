//! Netstring framing: `<decimal length>:<payload>,`.
//!
//! Frames are self-delimiting, so message boundaries survive partial reads and
//! writes on stream sockets. Both directions of every link use this framing.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};

pub const MAX_FRAME_SIZE: usize = 64 << 20;
const MAX_LEN_DIGITS: usize = 20;

/// Encodes one payload as a netstring frame.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity(payload.len() + MAX_LEN_DIGITS + 2);
    bytes.extend_from_slice(payload.len().to_string().as_bytes());
    bytes.extend_from_slice(b":");
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(b",");
    bytes.freeze()
}

/// Extracts the next complete frame from `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed. Consumed bytes are removed
/// from the buffer only when a complete frame is returned.
///
/// # Errors
///
/// Fails with [`ErrorKind::FramingFailed`] on a malformed length prefix, an
/// oversized frame or a missing terminator.
pub fn parse_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    let Some(colon) = buffer.iter().take(MAX_LEN_DIGITS + 1).position(|&b| b == b':') else {
        if buffer.len() > MAX_LEN_DIGITS {
            return Err(framing_error("length prefix is too long"));
        }
        if let Some(b) = buffer.iter().find(|b| !b.is_ascii_digit()) {
            return Err(framing_error(format!("invalid length byte: 0x{b:02x}")));
        }
        return Ok(None);
    };

    let digits = &buffer[..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(framing_error(format!(
            "invalid length prefix: {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(framing_error("length prefix has leading zeros"));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| framing_error("length prefix overflows"))?;
    if len >= MAX_FRAME_SIZE {
        return Err(framing_error(format!("frame is too long: {len}")));
    }

    let header = colon + 1;
    if buffer.len() < header + len + 1 {
        return Ok(None);
    }
    if buffer[header + len] != b',' {
        return Err(framing_error(format!(
            "missing frame terminator, got 0x{:02x}",
            buffer[header + len]
        )));
    }

    buffer.advance(header);
    let frame = buffer.split_to(len).freeze();
    buffer.advance(1);
    Ok(Some(frame))
}

fn framing_error(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::FramingFailed, msg)
}

/// Read half of a framed stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(64 << 10),
        }
    }

    /// Suspends until a full message is available.
    ///
    /// Returns `Ok(None)` when the stream closes cleanly between frames.
    ///
    /// # Errors
    ///
    /// Fails on malformed frames, read errors, or when the stream closes in
    /// the middle of a frame.
    pub async fn read_message(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = parse_frame(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(framing_error(format!(
                    "stream closed mid-frame with {} buffered bytes",
                    self.buffer.len()
                )));
            }
        }
    }
}

/// Write half of a framed stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// # Errors
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(&encode_frame(payload)).await
    }

    /// Writes an already encoded frame.
    ///
    /// # Errors
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer
            .write_all(frame)
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))
    }

    /// # Errors
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))
    }
}
