//! Provides the BEEP frame types as well as utilities for parsing frames
//! from a byte stream and serializing them back out.
//!
//! A data frame on the wire is an ASCII header line, the payload octets,
//! and the fixed trailer `END\r\n`:
//!
//! ```text
//! <type> <channel> <msgno> <more> <seqno> <size>[ <ansno>]\r\n
//! ```
//!
//! SEQ frames are a bare header line with no payload and no trailer:
//!
//! ```text
//! SEQ <channel> <ackno> <window>\r\n
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

/// Upper bound on a single frame payload, guarding the read buffer against
/// a hostile `size` field. Local receive windows are capped to the same
/// value, so a conforming peer can never hit this limit.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Longest legal header line including the terminating `\r\n`.
pub const MAX_HEADER_SIZE: usize = 64;

/// Message numbers are 31-bit unsigned.
pub const MAX_MSGNO: u32 = 0x7FFF_FFFF;

/// Fixed trailer closing every data frame.
pub const TRAILER: &[u8] = b"END\r\n";

/// The five data frame types. SEQ frames are represented separately by
/// [`SeqFrame`] since they carry flow-control state rather than payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// A request carrying application content.
    Msg,
    /// A positive reply to a MSG.
    Rpy,
    /// A negative reply to a MSG.
    Err,
    /// One member of a one-to-many reply series.
    Ans,
    /// Terminates an ANS reply series. Always empty, never fragmented.
    Nul,
}

impl FrameType {
    pub(crate) fn mnemonic(&self) -> &'static str {
        match self {
            FrameType::Msg => "MSG",
            FrameType::Rpy => "RPY",
            FrameType::Err => "ERR",
            FrameType::Ans => "ANS",
            FrameType::Nul => "NUL",
        }
    }

    /// True for the four reply types (everything except MSG).
    pub fn is_reply(&self) -> bool {
        !matches!(self, FrameType::Msg)
    }

    /// True for the reply types that finish a message exchange when their
    /// final frame is seen: RPY, ERR and NUL. ANS frames keep the exchange
    /// open until the NUL arrives.
    pub fn completes_exchange(&self) -> bool {
        matches!(self, FrameType::Rpy | FrameType::Err | FrameType::Nul)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A parsed data frame.
///
/// `seqno` is the octet offset of `payload` within the channel's send
/// stream, modulo 2^32. `ansno` is present exactly when `frame_type` is
/// [`FrameType::Ans`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel: u16,
    pub msgno: u32,
    pub more: bool,
    pub seqno: u32,
    pub ansno: Option<u32>,
    pub payload: Bytes,
}

/// A flow-control advertisement: the peer will accept payload octets for
/// `channel` up to `ackno + window` (modulo 2^32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqFrame {
    pub channel: u16,
    pub ackno: u32,
    pub window: u32,
}

/// Anything the parser can produce from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Data(Frame),
    Seq(SeqFrame),
}

/// Codec errors with enough context to produce a useful diagnostic before
/// the session is torn down.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough data is buffered to parse a complete frame.
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("unknown frame type {0:?}")]
    UnknownType(String),

    #[error("malformed header token in field '{field}'")]
    InvalidToken { field: &'static str },

    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("header line exceeds {MAX_HEADER_SIZE} octets")]
    HeaderTooLong,

    #[error("frame payload of {0} octets exceeds the maximum")]
    PayloadTooLarge(u32),

    #[error("missing or corrupt END trailer")]
    BadTrailer,

    #[error("continuation frame with empty payload")]
    EmptyFragment,

    #[error("NUL frame with payload or continuation flag")]
    NulViolation,

    #[error("frame of {size} octets exceeds the remote window budget of {budget}")]
    WindowExceeded { size: usize, budget: usize },
}

impl WireFrame {
    /// Checks whether an entire frame can be decoded from `src`. On success
    /// returns the total number of buffered octets the frame occupies, so
    /// the caller can size its `advance`.
    ///
    /// Header syntax is validated here; a malformed header is an error even
    /// when the payload has not arrived yet, so garbage tears the session
    /// down before it can grow the read buffer.
    #[tracing::instrument(skip(src))]
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<usize, FrameError> {
        let start = src.position() as usize;
        let header = Header::parse(src)?;
        let header_len = src.position() as usize - start;

        match header.body {
            HeaderBody::Seq { .. } => Ok(header_len),
            HeaderBody::Data { size, .. } => {
                let total = header_len + size as usize + TRAILER.len();
                if src.remaining() < size as usize + TRAILER.len() {
                    return Err(FrameError::Incomplete);
                }
                Ok(total)
            }
        }
    }

    /// Parses one frame from `src`, consuming exactly the octets `check`
    /// accounted for. The caller is expected to have buffered a complete
    /// frame; payload truncation surfaces as `Incomplete`.
    #[tracing::instrument(skip(src))]
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<WireFrame, FrameError> {
        let header = Header::parse(src)?;

        match header.body {
            HeaderBody::Seq { ackno, window } => Ok(WireFrame::Seq(SeqFrame {
                channel: header.channel,
                ackno,
                window,
            })),
            HeaderBody::Data {
                frame_type,
                msgno,
                more,
                seqno,
                size,
                ansno,
            } => {
                if src.remaining() < size as usize + TRAILER.len() {
                    return Err(FrameError::Incomplete);
                }
                let payload = src.copy_to_bytes(size as usize);
                let mut trailer = [0u8; 5];
                src.copy_to_slice(&mut trailer);
                if trailer != TRAILER {
                    return Err(FrameError::BadTrailer);
                }

                let frame = Frame {
                    frame_type,
                    channel: header.channel,
                    msgno,
                    more,
                    seqno,
                    ansno,
                    payload,
                };
                frame.validate()?;
                Ok(WireFrame::Data(frame))
            }
        }
    }
}

impl Frame {
    /// Checks the structural invariants that tie the header fields to the
    /// payload: a continuation frame must carry octets, and NUL is always
    /// empty and final.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.frame_type == FrameType::Nul && (self.more || !self.payload.is_empty()) {
            return Err(FrameError::NulViolation);
        }
        if self.more && self.payload.is_empty() {
            return Err(FrameError::EmptyFragment);
        }
        Ok(())
    }

    /// Serializes the frame into `dst`. `budget` is the number of payload
    /// octets the peer's advertised window still accepts; a frame that
    /// would overrun it is refused rather than written.
    pub fn encode(&self, dst: &mut BytesMut, budget: usize) -> Result<(), FrameError> {
        self.validate()?;
        if self.payload.len() > budget {
            return Err(FrameError::WindowExceeded {
                size: self.payload.len(),
                budget,
            });
        }

        dst.reserve(MAX_HEADER_SIZE + self.payload.len() + TRAILER.len());
        dst.put_slice(self.frame_type.mnemonic().as_bytes());
        put_field(dst, self.channel as u64);
        put_field(dst, self.msgno as u64);
        dst.put_slice(if self.more { b" *" } else { b" ." });
        put_field(dst, self.seqno as u64);
        put_field(dst, self.payload.len() as u64);
        if let Some(ansno) = self.ansno {
            put_field(dst, ansno as u64);
        }
        dst.put_slice(b"\r\n");
        dst.put_slice(&self.payload);
        dst.put_slice(TRAILER);
        Ok(())
    }
}

impl SeqFrame {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(MAX_HEADER_SIZE);
        dst.put_slice(b"SEQ");
        put_field(dst, self.channel as u64);
        put_field(dst, self.ackno as u64);
        put_field(dst, self.window as u64);
        dst.put_slice(b"\r\n");
    }
}

fn put_field(dst: &mut BytesMut, value: u64) {
    dst.put_u8(b' ');
    let mut buf = [0u8; 20];
    let mut n = value;
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    dst.put_slice(&buf[pos..]);
}

/// The decoded header line, before payload extraction.
struct Header {
    channel: u16,
    body: HeaderBody,
}

enum HeaderBody {
    Data {
        frame_type: FrameType,
        msgno: u32,
        more: bool,
        seqno: u32,
        size: u32,
        ansno: Option<u32>,
    },
    Seq {
        ackno: u32,
        window: u32,
    },
}

impl Header {
    fn parse(src: &mut Cursor<&[u8]>) -> Result<Header, FrameError> {
        let line = take_line(src)?;
        let mut tokens = Tokens::new(line);

        let mnemonic = tokens.next("type")?;
        match mnemonic {
            b"SEQ" => {
                let channel = tokens.number("channel", u16::MAX as u64)? as u16;
                let ackno = tokens.number("ackno", u32::MAX as u64)? as u32;
                let window = tokens.number("window", u32::MAX as u64)? as u32;
                tokens.finish()?;
                Ok(Header {
                    channel,
                    body: HeaderBody::Seq { ackno, window },
                })
            }
            b"MSG" | b"RPY" | b"ERR" | b"ANS" | b"NUL" => {
                let frame_type = match mnemonic {
                    b"MSG" => FrameType::Msg,
                    b"RPY" => FrameType::Rpy,
                    b"ERR" => FrameType::Err,
                    b"ANS" => FrameType::Ans,
                    _ => FrameType::Nul,
                };
                let channel = tokens.number("channel", u16::MAX as u64)? as u16;
                let msgno = tokens.number("msgno", MAX_MSGNO as u64)? as u32;
                let more = match tokens.next("more")? {
                    b"." => false,
                    b"*" => true,
                    _ => return Err(FrameError::InvalidToken { field: "more" }),
                };
                let seqno = tokens.number("seqno", u32::MAX as u64)? as u32;
                let size = tokens.number("size", u32::MAX as u64)? as u32;
                if size > MAX_PAYLOAD_SIZE {
                    return Err(FrameError::PayloadTooLarge(size));
                }
                let ansno = if frame_type == FrameType::Ans {
                    Some(tokens.number("ansno", u32::MAX as u64)? as u32)
                } else {
                    None
                };
                tokens.finish()?;
                Ok(Header {
                    channel,
                    body: HeaderBody::Data {
                        frame_type,
                        msgno,
                        more,
                        seqno,
                        size,
                        ansno,
                    },
                })
            }
            other => Err(FrameError::UnknownType(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// Consumes one `\r\n`-terminated header line from `src`, returning the
/// line without its terminator.
fn take_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], FrameError> {
    let start = src.position() as usize;
    let buf = *src.get_ref();
    let window = &buf[start..];

    for i in 0..window.len().saturating_sub(1) {
        if i + 2 > MAX_HEADER_SIZE {
            return Err(FrameError::HeaderTooLong);
        }
        if window[i] == b'\r' && window[i + 1] == b'\n' {
            src.set_position((start + i + 2) as u64);
            return Ok(&window[..i]);
        }
    }
    if window.len() > MAX_HEADER_SIZE {
        return Err(FrameError::HeaderTooLong);
    }
    Err(FrameError::Incomplete)
}

/// Splits a header line on single spaces. Consecutive separators produce
/// an empty token, which every field parser rejects, so `a  b` is as
/// malformed as the grammar requires.
struct Tokens<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a [u8]) -> Tokens<'a> {
        Tokens { rest: Some(line) }
    }

    fn next(&mut self, field: &'static str) -> Result<&'a [u8], FrameError> {
        let rest = self.rest.ok_or(FrameError::InvalidToken { field })?;
        match rest.iter().position(|&b| b == b' ') {
            Some(i) => {
                self.rest = Some(&rest[i + 1..]);
                if i == 0 {
                    return Err(FrameError::InvalidToken { field });
                }
                Ok(&rest[..i])
            }
            None => {
                self.rest = None;
                if rest.is_empty() {
                    return Err(FrameError::InvalidToken { field });
                }
                Ok(rest)
            }
        }
    }

    fn number(&mut self, field: &'static str, max: u64) -> Result<u64, FrameError> {
        let token = self.next(field)?;
        if token.is_empty() || token.len() > 10 {
            return Err(FrameError::InvalidToken { field });
        }
        let mut value: u64 = 0;
        for &b in token {
            if !b.is_ascii_digit() {
                return Err(FrameError::InvalidToken { field });
            }
            value = value * 10 + (b - b'0') as u64;
        }
        if value > max {
            return Err(FrameError::OutOfRange { field, value });
        }
        Ok(value)
    }

    fn finish(&mut self) -> Result<(), FrameError> {
        match self.rest {
            None => Ok(()),
            Some(_) => Err(FrameError::InvalidToken { field: "trailing" }),
        }
    }
}

/// Wrapping sequence-space comparison: true when `a` is at or after `b`,
/// assuming the two are within 2^31 of each other.
pub(crate) fn seq_ge(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) < 0x8000_0000
}
