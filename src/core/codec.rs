//! # Stream Codecs
//!
//! `tokio_util::codec` implementations for the two wire protocols.
//!
//! - [`LineCodec`]: CRLF-terminated text lines, scanned with a two-state
//!   (`seen-CR` / `not-seen-CR`) machine. A CR followed by anything other than
//!   LF drops both bytes and resumes scanning.
//! - [`FrameCodec`]: `tag:i32 || length:i32` headers followed by `length` bytes,
//!   alternating `AwaitHeader → AwaitPayload → AwaitHeader`.
//!
//! Both decoders keep a connection usable after bad input: overlong lines and
//! rejected frames surface as items rather than stream errors. Only a negative
//! frame length, which leaves no way to resynchronise, is a hard error.

use crate::error::{PortalError, Result};
use crate::protocol::frame::{Frame, FrameTag, FRAME_HEADER_LEN};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Default maximum text line length (bytes, excluding CRLF)
pub const DEFAULT_MAX_LINE_LEN: usize = 512;

/// Default maximum binary frame payload
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// One scanned text line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextInput {
    Line(String),
    /// Line exceeded the maximum length and was discarded
    Overlong,
    /// Line contained bytes outside 7-bit ASCII
    Malformed,
}

#[derive(Debug)]
pub struct LineCodec {
    max_len: usize,
    line: Vec<u8>,
    seen_cr: bool,
    overlong: bool,
    malformed: bool,
}

impl LineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            line: Vec::new(),
            seen_cr: false,
            overlong: false,
            malformed: false,
        }
    }

    fn finish_line(&mut self) -> TextInput {
        let item = if self.overlong {
            TextInput::Overlong
        } else if self.malformed {
            TextInput::Malformed
        } else {
            TextInput::Line(String::from_utf8_lossy(&self.line).into_owned())
        };
        self.line.clear();
        self.overlong = false;
        self.malformed = false;
        item
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LEN)
    }
}

impl Decoder for LineCodec {
    type Item = TextInput;
    type Error = PortalError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TextInput>> {
        let mut consumed = 0;
        let mut finished = None;

        for &byte in src.iter() {
            consumed += 1;
            if self.seen_cr {
                self.seen_cr = false;
                if byte == b'\n' {
                    finished = Some(self.finish_line());
                    break;
                }
                debug!("Dropping bare carriage return");
            } else if byte == b'\r' {
                self.seen_cr = true;
            } else if byte > 0x7f {
                self.malformed = true;
            } else if self.line.len() >= self.max_len {
                self.overlong = true;
            } else {
                self.line.push(byte);
            }
        }

        src.advance(consumed);
        Ok(finished)
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = PortalError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<()> {
        let line = line.as_ref();
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Which side of the binary protocol a codec serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Relay side: accepts tags 0-2
    Server,
    /// Client side: accepts `ITEM_DELIVERY`
    Client,
}

/// One decoded binary frame, or the reason it was dropped
#[derive(Debug)]
pub enum FrameInput {
    Frame(Frame),
    Rejected(PortalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    AwaitHeader,
    AwaitPayload { tag: FrameTag, len: usize },
    Discard { remaining: usize },
}

#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_len: usize,
    state: FrameState,
}

impl FrameCodec {
    pub fn new(role: Role, max_len: usize) -> Self {
        Self {
            role,
            max_len,
            state: FrameState::AwaitHeader,
        }
    }

    pub fn server(max_len: usize) -> Self {
        Self::new(Role::Server, max_len)
    }

    pub fn client(max_len: usize) -> Self {
        Self::new(Role::Client, max_len)
    }

    fn accepts(&self, tag: FrameTag) -> bool {
        match self.role {
            Role::Server => tag.is_inbound(),
            Role::Client => !tag.is_inbound(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = FrameInput;
    type Error = PortalError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrameInput>> {
        loop {
            match self.state {
                FrameState::AwaitHeader => {
                    if src.len() < FRAME_HEADER_LEN {
                        src.reserve(FRAME_HEADER_LEN - src.len());
                        return Ok(None);
                    }

                    let raw_tag = src.get_i32();
                    let raw_len = src.get_i32();
                    if raw_len < 0 {
                        return Err(PortalError::InvalidFrameLength(raw_len));
                    }
                    let len = raw_len as usize;

                    if len > self.max_len {
                        warn!(tag = raw_tag, len, "Dropping oversized frame");
                        self.state = FrameState::Discard { remaining: len };
                        return Ok(Some(FrameInput::Rejected(PortalError::OversizedFrame(len))));
                    }

                    match FrameTag::try_from(raw_tag) {
                        Ok(tag) if self.accepts(tag) => {
                            self.state = FrameState::AwaitPayload { tag, len };
                        }
                        _ => {
                            warn!(tag = raw_tag, len, "Dropping frame with unexpected tag");
                            self.state = FrameState::Discard { remaining: len };
                            return Ok(Some(FrameInput::Rejected(PortalError::UnknownFrameTag(
                                raw_tag,
                            ))));
                        }
                    }
                }
                FrameState::AwaitPayload { tag, len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    self.state = FrameState::AwaitHeader;
                    return Ok(Some(FrameInput::Frame(Frame { tag, payload })));
                }
                FrameState::Discard { remaining } => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if n < remaining {
                        self.state = FrameState::Discard {
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                    self.state = FrameState::AwaitHeader;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<FrameInput>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() || matches!(self.state, FrameState::AwaitPayload { .. }) {
                    debug!(buffered = src.len(), "Truncated frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PortalError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if len > i32::MAX as usize {
            return Err(PortalError::OversizedFrame(len));
        }
        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_i32(frame.tag.into());
        dst.put_i32(len as i32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
