// ABOUTME: Wire-level frame codec: 5-byte header wrapping an opaque body
// ABOUTME: Header layout is len(24-bit BE) | type(1 byte) | flags(1 byte)

use std::fmt;
use std::io::Write;

use bitflags::bitflags;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::codec::{Codec, Envelope};
use crate::error::{Error, Result};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest body a frame can carry: one byte less than 16 MB (uint24).
pub const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// The 1-byte frame type. Only DATA frames are dispatched; SETTINGS and
/// PING are reserved, their bodies are consumed and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Settings = 0x1,
    Ping = 0x2,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Data => write!(f, "DATA"),
            FrameType::Settings => write!(f, "SETTINGS"),
            FrameType::Ping => write!(f, "PING"),
            FrameType::Unknown(t) => write!(f, "UNKNOWN_FRAME_TYPE_{t}"),
        }
    }
}

bitflags! {
    /// The 1 byte of per-frame flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// Must be set on every inbound frame.
        const ACK = 0x10;
        /// Declared for wire compatibility, never validated.
        const END_STREAM = 0x1;
    }
}

/// Parsed frame header. The body follows it on the wire, `length` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: Flags,
}

impl FrameHeader {
    /// Parse and validate a header from its 5 raw bytes.
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Result<FrameHeader> {
        let fh = FrameHeader {
            length: u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2]),
            frame_type: FrameType::from(buf[3]),
            flags: Flags::from_bits_retain(buf[4]),
        };
        fh.validate()?;
        Ok(fh)
    }

    fn validate(&self) -> Result<()> {
        if self.length > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge);
        }
        if !self.flags.contains(Flags::ACK) {
            return Err(Error::FrameFlags);
        }
        Ok(())
    }
}

/// Check whether `buf` starts with a valid frame header.
///
/// `Ok(None)` means the 5 header bytes are not all buffered yet, the
/// normal condition while a frame trickles in. The header is validated and
/// returned as soon as it is complete, before any of the body has arrived;
/// use [`body_complete`] to tell when the frame it heads can be consumed.
pub fn check(buf: &[u8]) -> Result<Option<FrameHeader>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    hdr.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    Ok(Some(FrameHeader::parse(&hdr)?))
}

/// True once `buf` holds the whole frame headed by `fh`.
pub fn body_complete(buf: &[u8], fh: FrameHeader) -> bool {
    buf.len() >= FRAME_HEADER_LEN + fh.length as usize
}

/// Write one DATA frame carrying `data`, header and body in a single write.
pub fn write_data<W: Write>(w: &mut W, data: &[u8]) -> Result<()> {
    if data.len() >= (1 << 24) {
        return Err(Error::FrameTooLarge);
    }

    let length = data.len();
    let header = [
        (length >> 16) as u8,
        (length >> 8) as u8,
        length as u8,
        FrameType::Data.into(),
        Flags::ACK.bits(),
    ];

    let mut wbuf = Vec::with_capacity(FRAME_HEADER_LEN + length);
    wbuf.extend_from_slice(&header);
    wbuf.extend_from_slice(data);

    let n = w.write(&wbuf)?;
    if n != wbuf.len() {
        return Err(Error::ShortWrite);
    }
    Ok(())
}

/// Encode `envelope` with the payload codec, then frame it as DATA.
pub fn write_frame<W: Write>(w: &mut W, envelope: &Envelope, codec: &dyn Codec) -> Result<()> {
    let payload = codec.encode(envelope).map_err(Error::CodecEncode)?;
    write_data(w, &payload)
}
