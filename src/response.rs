// ABOUTME: Per-response write adapter binding a pooled buffer to the payload codec
// ABOUTME: The only write path handlers use; the connection flushes the buffer afterwards

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::codec::{Codec, Envelope};
use crate::error::Result;
use crate::frame;

/// Status reported when a handler never set one.
pub const DEFAULT_STATUS: u16 = 200;

const DEFAULT_KEEP_ALIVE: bool = true;

/// Buffers one response while the handler chain runs.
///
/// `write` frames an envelope through the payload codec into the staging
/// buffer; nothing reaches the socket until the connection flushes after
/// dispatch. The status code is observability metadata only, it is never
/// serialized onto the wire. Clearing `keep_alive` makes the connection
/// close once the buffered response has been flushed.
pub struct ResponseWriter {
    buf: BytesMut,
    status: u16,
    keep_alive: bool,
    codec: Arc<dyn Codec>,
}

impl ResponseWriter {
    pub fn new(buf: BytesMut, codec: Arc<dyn Codec>) -> ResponseWriter {
        ResponseWriter {
            buf,
            status: DEFAULT_STATUS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            codec,
        }
    }

    pub fn set_status(&mut self, code: u16) {
        self.status = code;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, value: bool) {
        self.keep_alive = value;
    }

    /// Number of response bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Frame `envelope` into the response buffer.
    ///
    /// Encode failures are logged and returned to the handler; they do not
    /// fail the connection by themselves.
    pub fn write(&mut self, envelope: &Envelope) -> Result<()> {
        frame::write_frame(&mut (&mut self.buf).writer(), envelope, &*self.codec).inspect_err(
            |err| {
                tracing::error!(target: "gantry::response", error = %err, type_url = %envelope.type_url, "response write failed");
            },
        )
    }

    /// Hand the staging buffer back to the connection for flushing.
    pub(crate) fn into_buf(self) -> BytesMut {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryCodec;
    use crate::frame::FRAME_HEADER_LEN;

    fn writer() -> ResponseWriter {
        ResponseWriter::new(BytesMut::new(), Arc::new(BinaryCodec))
    }

    #[test]
    fn defaults() {
        let w = writer();
        assert_eq!(w.status(), DEFAULT_STATUS);
        assert!(w.keep_alive());
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn write_frames_through_codec() {
        let mut w = writer();
        let env = Envelope::new("pb.Pong", &b"pong"[..]);
        w.write(&env).unwrap();

        assert!(w.buffered() > FRAME_HEADER_LEN);

        let buf = w.into_buf();
        let fh = frame::check(&buf).unwrap().expect("complete frame");
        let body = &buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + fh.length as usize];
        let decoded = BinaryCodec.decode(body).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn consecutive_writes_append() {
        let mut w = writer();
        w.write(&Envelope::new("pb.A", &b"1"[..])).unwrap();
        let after_one = w.buffered();
        w.write(&Envelope::new("pb.B", &b"2"[..])).unwrap();
        assert!(w.buffered() > after_one);
    }

    #[test]
    fn status_and_keep_alive_mutators() {
        let mut w = writer();
        w.set_status(404);
        w.set_keep_alive(false);
        assert_eq!(w.status(), 404);
        assert!(!w.keep_alive());
    }

    #[test]
    fn encode_failure_is_surfaced_not_buffered() {
        let mut w = writer();
        let bad = Envelope::new("", &b"x"[..]);
        assert!(w.write(&bad).is_err());
        assert_eq!(w.buffered(), 0);
    }
}
