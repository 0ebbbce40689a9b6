// src/core/client/protocol.rs

//! Client-side RESP2 framing for the store connection.
//!
//! Only the frame types a client exchanges are covered. Decoding is driven
//! by a `Scanner` that walks the receive buffer and reports "not enough data
//! yet" as `None`, so a partially received reply simply leaves the buffer
//! untouched until more bytes arrive.

use crate::core::CoordinatorError;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt::Display;
use tokio_util::codec::{Decoder, Encoder};

// The coordinator's replies are small (status hashes, JSON snapshots); the
// one large payload it ever moves is a calibration-solution blob. Anything
// past these bounds is a corrupt stream, not a real reply.
const MAX_BULK_LEN: usize = 64 * 1024 * 1024;
const MAX_ARRAY_LEN: usize = 65_536;

/// A single RESP2 protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a command frame (array of bulk strings) from its parts.
    pub fn command<I, S>(parts: I) -> RespFrame
    where
        I: IntoIterator<Item = S>,
        S: Into<Bytes>,
    {
        RespFrame::Array(
            parts
                .into_iter()
                .map(|p| RespFrame::BulkString(p.into()))
                .collect(),
        )
    }

    /// Interprets the frame as a UTF-8 string where that makes sense.
    pub fn into_string(self) -> Option<String> {
        match self {
            RespFrame::SimpleString(s) => Some(s),
            RespFrame::BulkString(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            RespFrame::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

/// A `tokio_util::codec` implementation for `RespFrame`s.
#[derive(Debug, Default)]
pub struct RespCodec;

/// Writes one `<prefix><value>\r\n` header line.
fn put_header(dst: &mut BytesMut, prefix: char, value: impl Display) {
    dst.extend_from_slice(format!("{prefix}{value}\r\n").as_bytes());
}

impl Encoder<RespFrame> for RespCodec {
    type Error = CoordinatorError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => put_header(dst, '+', s),
            RespFrame::Error(s) => put_header(dst, '-', s),
            RespFrame::Integer(i) => put_header(dst, ':', i),
            RespFrame::BulkString(b) => {
                put_header(dst, '$', b.len());
                dst.extend_from_slice(&b);
                dst.extend_from_slice(b"\r\n");
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(items) => {
                put_header(dst, '*', items.len());
                for frame in items {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = RespFrame;
    type Error = CoordinatorError;

    /// Returns `Ok(None)` while the buffer does not yet hold a full frame,
    /// letting the `Framed` stream wait for more data.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (frame, consumed) = {
            let mut scanner = Scanner::new(&src[..]);
            match scanner.frame()? {
                Some(frame) => (frame, scanner.consumed()),
                None => return Ok(None),
            }
        };
        src.advance(consumed);
        Ok(Some(frame))
    }
}

/// Walks a receive buffer one frame at a time. The position only moves while
/// the bytes it needs are present, so an incomplete frame never consumes
/// anything.
struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed by fully scanned frames.
    fn consumed(&self) -> usize {
        self.pos
    }

    /// The next byte, if it has arrived.
    fn byte(&mut self) -> Option<u8> {
        let b = self.buf.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    /// The next `n` bytes, if they have arrived.
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let chunk = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(chunk)
    }

    /// The next CRLF-terminated line, without its terminator.
    fn line(&mut self) -> Option<&'a [u8]> {
        let rest = self.buf.get(self.pos..)?;
        let end = rest.windows(2).position(|w| w == b"\r\n")?;
        self.pos += end + 2;
        Some(&rest[..end])
    }

    /// A header line carrying a decimal count or length.
    fn length_line(&mut self) -> Result<Option<i64>, CoordinatorError> {
        match self.line() {
            Some(line) => Ok(Some(ascii_i64(line)?)),
            None => Ok(None),
        }
    }

    /// Scans one frame. `Ok(None)` means the frame has not fully arrived.
    fn frame(&mut self) -> Result<Option<RespFrame>, CoordinatorError> {
        let Some(prefix) = self.byte() else {
            return Ok(None);
        };
        match prefix {
            b'+' => Ok(self
                .line()
                .map(|line| RespFrame::SimpleString(lossy(line)))),
            b'-' => Ok(self.line().map(|line| RespFrame::Error(lossy(line)))),
            b':' => match self.line() {
                Some(line) => Ok(Some(RespFrame::Integer(ascii_i64(line)?))),
                None => Ok(None),
            },
            b'$' => self.bulk_string(),
            b'*' => self.array(),
            other => Err(CoordinatorError::ProtocolError(format!(
                "unknown RESP type prefix: 0x{other:02x}"
            ))),
        }
    }

    fn bulk_string(&mut self) -> Result<Option<RespFrame>, CoordinatorError> {
        let Some(len) = self.length_line()? else {
            return Ok(None);
        };
        // A negative length is the null bulk string.
        if len < 0 {
            return Ok(Some(RespFrame::Null));
        }
        let len = len as usize;
        if len > MAX_BULK_LEN {
            return Err(CoordinatorError::ProtocolError(format!(
                "bulk string of {len} bytes exceeds the reply limit"
            )));
        }
        let Some(data) = self.take(len) else {
            return Ok(None);
        };
        let Some(terminator) = self.take(2) else {
            return Ok(None);
        };
        if terminator != b"\r\n" {
            return Err(CoordinatorError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }
        Ok(Some(RespFrame::BulkString(Bytes::copy_from_slice(data))))
    }

    fn array(&mut self) -> Result<Option<RespFrame>, CoordinatorError> {
        let Some(len) = self.length_line()? else {
            return Ok(None);
        };
        // A negative count is the null array.
        if len < 0 {
            return Ok(Some(RespFrame::NullArray));
        }
        let len = len as usize;
        if len > MAX_ARRAY_LEN {
            return Err(CoordinatorError::ProtocolError(format!(
                "array of {len} elements exceeds the reply limit"
            )));
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            match self.frame()? {
                Some(frame) => items.push(frame),
                None => return Ok(None),
            }
        }
        Ok(Some(RespFrame::Array(items)))
    }
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn ascii_i64(line: &[u8]) -> Result<i64, CoordinatorError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CoordinatorError::ProtocolError(format!(
                "bad decimal field: {}",
                String::from_utf8_lossy(line)
            ))
        })
}
