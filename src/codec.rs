// ABOUTME: Pluggable payload codec: the {type_url, value} envelope around a frame body
// ABOUTME: Ships a compact binary codec and a JSON codec; selection is per-server

use std::io::Cursor;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The payload envelope carried inside every DATA frame: a short string
/// naming the message kind, and the opaque message bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub type_url: String,
    pub value: Bytes,
}

impl Envelope {
    pub fn new(type_url: impl Into<String>, value: impl Into<Bytes>) -> Envelope {
        Envelope {
            type_url: type_url.into(),
            value: value.into(),
        }
    }
}

/// One decoded request, alive for a single handler invocation.
#[derive(Debug, Clone)]
pub struct Request {
    pub type_url: String,
    pub data: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new(envelope: Envelope, remote_addr: Option<SocketAddr>) -> Request {
        Request {
            type_url: envelope.type_url,
            data: envelope.value,
            remote_addr,
        }
    }
}

/// Errors raised while encoding or decoding the payload envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete envelope: need more data")]
    Incomplete,

    #[error("empty type url")]
    EmptyTypeUrl,

    #[error("type url too long: {0} bytes")]
    TypeUrlTooLong(usize),

    #[error("invalid UTF-8 in type url")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("json envelope error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode/decode seam between the frame layer and handler payloads.
///
/// Implementations must be stateless; one codec instance is shared by every
/// connection of a server. The router never inspects the codec.
pub trait Codec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<Envelope, CodecError>;
}

/// Compact binary envelope: `u16` big-endian type-url length, the url
/// bytes, then the value occupying the rest of the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        if envelope.type_url.is_empty() {
            return Err(CodecError::EmptyTypeUrl);
        }
        let url = envelope.type_url.as_bytes();
        if url.len() > usize::from(u16::MAX) {
            return Err(CodecError::TypeUrlTooLong(url.len()));
        }

        let mut buf = Vec::with_capacity(2 + url.len() + envelope.value.len());
        buf.put_u16(url.len() as u16);
        buf.put_slice(url);
        buf.put_slice(&envelope.value);
        Ok(buf)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        let mut buf = Cursor::new(data);
        if buf.remaining() < 2 {
            return Err(CodecError::Incomplete);
        }
        let url_len = usize::from(buf.get_u16());
        if url_len == 0 {
            return Err(CodecError::EmptyTypeUrl);
        }
        if buf.remaining() < url_len {
            return Err(CodecError::Incomplete);
        }

        let type_url = String::from_utf8(buf.copy_to_bytes(url_len).to_vec())?;
        let value = buf.copy_to_bytes(buf.remaining());
        Ok(Envelope { type_url, value })
    }
}

/// JSON envelope, for peers that prefer a self-describing body.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        if envelope.type_url.is_empty() {
            return Err(CodecError::EmptyTypeUrl);
        }
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        if envelope.type_url.is_empty() {
            return Err(CodecError::EmptyTypeUrl);
        }
        Ok(envelope)
    }
}
