//! Framed TCP codecs for the Visor wire protocol.
//!
//! # Wire format
//!
//! All integers are big-endian.
//!
//! ```text
//! frame:   tag:u32  payload (kind-specific)
//! string:  len:u16  utf-8 bytes
//! blob:    len:u32  raw bytes
//! bool:    u8       (0 = false, nonzero = true)
//! ```
//!
//! The two directions share kind tags but carry different payloads,
//! so there are two codecs:
//!
//! - [`HostCodec`] — used by the host: decodes [`ClientFrame`],
//!   encodes [`HostFrame`]
//! - [`ClientCodec`] — used by a peer: decodes [`HostFrame`],
//!   encodes [`ClientFrame`]
//!
//! A buffer that does not yet hold a whole frame decodes to
//! `Ok(None)`; EOF mid-frame is [`VisorError::Incomplete`]; an
//! unrecognised tag is [`VisorError::UnknownKind`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::VisorError;
use crate::frame::{ClientFrame, FrameKind, HostFrame};

// ── Limits ───────────────────────────────────────────────────────

/// Hard cap on a single frame, including all length-prefixed fields.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A string field is limited by its 2-byte length prefix; this counts
/// encoded bytes, not characters.
pub const MAX_STRING_BYTES: usize = u16::MAX as usize;

/// Reject a string that would overflow its length prefix. Callers
/// validate user-supplied text with this before building a frame.
pub fn validate_str(s: &str) -> Result<(), VisorError> {
    if s.len() > MAX_STRING_BYTES {
        return Err(VisorError::PayloadTooLarge {
            len: s.len(),
            max: MAX_STRING_BYTES,
        });
    }
    Ok(())
}

// ── Reader ───────────────────────────────────────────────────────

/// Cursor over a byte slice. Running out of bytes yields
/// `VisorError::Incomplete`, which the decoders translate to
/// `Ok(None)` (wait for more data) while a frame is still arriving.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VisorError> {
        if self.buf.len() - self.pos < n {
            return Err(VisorError::Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, VisorError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, VisorError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, VisorError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bool(&mut self) -> Result<bool, VisorError> {
        Ok(self.u8()? != 0)
    }

    fn string(&mut self) -> Result<String, VisorError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn blob(&mut self) -> Result<Bytes, VisorError> {
        let len = self.u32()? as usize;
        if len > MAX_FRAME_SIZE {
            // Reject without waiting for the bytes to arrive.
            return Err(VisorError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}

// ── Writer helpers ───────────────────────────────────────────────

fn put_str(dst: &mut BytesMut, s: &str) -> Result<(), VisorError> {
    validate_str(s)?;
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn put_blob(dst: &mut BytesMut, data: &[u8]) -> Result<(), VisorError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(VisorError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
    Ok(())
}

fn put_bool(dst: &mut BytesMut, v: bool) {
    dst.put_u8(v as u8);
}

// ── Parse functions ──────────────────────────────────────────────

fn parse_client(r: &mut Reader<'_>) -> Result<ClientFrame, VisorError> {
    let kind = FrameKind::from_tag(r.u32()?)?;
    Ok(match kind {
        FrameKind::Authenticate => ClientFrame::Authenticate {
            password: r.string()?,
            name: r.string()?,
        },
        FrameKind::Chat => ClientFrame::Chat {
            content: r.string()?,
        },
        FrameKind::File => ClientFrame::File {
            name: r.string()?,
            data: r.blob()?,
        },
        FrameKind::Mouse => ClientFrame::Mouse {
            event_type: r.string()?,
            data: r.blob()?,
        },
        FrameKind::Keyboard => ClientFrame::Keyboard {
            event_type: r.string()?,
            data: r.blob()?,
        },
        FrameKind::Disconnect => ClientFrame::Disconnect,
        // Host-originated kinds never travel client→host.
        FrameKind::Screen | FrameKind::ControlGrant | FrameKind::ControlRevoke => {
            return Err(VisorError::WrongDirection { kind });
        }
    })
}

fn parse_host(r: &mut Reader<'_>) -> Result<HostFrame, VisorError> {
    let kind = FrameKind::from_tag(r.u32()?)?;
    Ok(match kind {
        FrameKind::Authenticate => HostFrame::AuthResult {
            success: r.bool()?,
            message: r.string()?,
        },
        FrameKind::Chat => HostFrame::Chat {
            sender: r.string()?,
            content: r.string()?,
        },
        FrameKind::File => HostFrame::File {
            sender: r.string()?,
            name: r.string()?,
            data: r.blob()?,
        },
        FrameKind::Screen => HostFrame::Screen { data: r.blob()? },
        FrameKind::ControlGrant => HostFrame::ControlGrant,
        FrameKind::ControlRevoke => HostFrame::ControlRevoke,
        // Client-originated kinds never travel host→client.
        FrameKind::Mouse | FrameKind::Keyboard | FrameKind::Disconnect => {
            return Err(VisorError::WrongDirection { kind });
        }
    })
}

/// Map a parse attempt onto the `Decoder` contract: consume the frame
/// on success, ask for more bytes on `Incomplete`, fail otherwise.
fn finish_decode<T>(
    src: &mut BytesMut,
    parsed: Result<T, VisorError>,
    consumed: usize,
) -> Result<Option<T>, VisorError> {
    match parsed {
        Ok(frame) => {
            src.advance(consumed);
            Ok(Some(frame))
        }
        Err(VisorError::Incomplete) => {
            if src.len() > MAX_FRAME_SIZE {
                return Err(VisorError::FrameTooLarge {
                    size: src.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ── HostCodec ────────────────────────────────────────────────────

/// Codec for the host side of a connection.
#[derive(Debug, Default)]
pub struct HostCodec;

impl HostCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for HostCodec {
    type Item = ClientFrame;
    type Error = VisorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientFrame>, VisorError> {
        let mut r = Reader::new(&src[..]);
        let parsed = parse_client(&mut r);
        let consumed = r.pos;
        finish_decode(src, parsed, consumed)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ClientFrame>, VisorError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(VisorError::Incomplete),
        }
    }
}

impl Encoder<HostFrame> for HostCodec {
    type Error = VisorError;

    fn encode(&mut self, item: HostFrame, dst: &mut BytesMut) -> Result<(), VisorError> {
        dst.put_u32(item.kind().tag());
        match item {
            HostFrame::AuthResult { success, message } => {
                put_bool(dst, success);
                put_str(dst, &message)?;
            }
            HostFrame::Chat { sender, content } => {
                put_str(dst, &sender)?;
                put_str(dst, &content)?;
            }
            HostFrame::File { sender, name, data } => {
                put_str(dst, &sender)?;
                put_str(dst, &name)?;
                put_blob(dst, &data)?;
            }
            HostFrame::Screen { data } => put_blob(dst, &data)?,
            HostFrame::ControlGrant | HostFrame::ControlRevoke => {}
        }
        Ok(())
    }
}

// ── ClientCodec ──────────────────────────────────────────────────

/// Codec for the peer side of a connection.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl ClientCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ClientCodec {
    type Item = HostFrame;
    type Error = VisorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HostFrame>, VisorError> {
        let mut r = Reader::new(&src[..]);
        let parsed = parse_host(&mut r);
        let consumed = r.pos;
        finish_decode(src, parsed, consumed)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<HostFrame>, VisorError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(VisorError::Incomplete),
        }
    }
}

impl Encoder<ClientFrame> for ClientCodec {
    type Error = VisorError;

    fn encode(&mut self, item: ClientFrame, dst: &mut BytesMut) -> Result<(), VisorError> {
        dst.put_u32(item.kind().tag());
        match item {
            ClientFrame::Authenticate { password, name } => {
                put_str(dst, &password)?;
                put_str(dst, &name)?;
            }
            ClientFrame::Chat { content } => put_str(dst, &content)?,
            ClientFrame::File { name, data } => {
                put_str(dst, &name)?;
                put_blob(dst, &data)?;
            }
            ClientFrame::Mouse { event_type, data } => {
                put_str(dst, &event_type)?;
                put_blob(dst, &data)?;
            }
            ClientFrame::Keyboard { event_type, data } => {
                put_str(dst, &event_type)?;
                put_blob(dst, &data)?;
            }
            ClientFrame::Disconnect => {}
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
