// ABOUTME: Crate-wide error type covering framing, codec and server failures
// ABOUTME: Per-connection errors terminate only the connection that raised them

use std::io;

use thiserror::Error;

use crate::codec::CodecError;

/// Errors surfaced by the framing layer, the payload codec seam and the
/// server lifecycle.
///
/// Frame and I/O errors are fatal for the connection that produced them;
/// other connections are unaffected. `ServerClosed` is the normal return of
/// `Server::serve` once a shutdown has begun.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame body length exceeds the 24-bit wire limit.
    #[error("tcp: frame too large")]
    FrameTooLarge,

    /// The mandatory ack bit was missing from an inbound frame header.
    #[error("tcp: frame flags error")]
    FrameFlags,

    /// The payload codec rejected an inbound DATA frame body.
    #[error("payload decode failed: {0}")]
    CodecDecode(#[source] CodecError),

    /// The payload codec failed to encode a response value.
    #[error("payload encode failed: {0}")]
    CodecEncode(#[source] CodecError),

    /// The sink accepted fewer bytes than the frame required.
    #[error("short write")]
    ShortWrite,

    /// Socket read/write/timeout failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Returned by accept/serve once `Shutdown` or `Close` has been called.
    #[error("tcp: server closed")]
    ServerClosed,
}

/// Specialized `Result` for server and framing operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the error came from the peer disappearing mid-stream
    /// rather than from a protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classification() {
        let reset = Error::Io(io::ErrorKind::ConnectionReset.into());
        assert!(reset.is_disconnect());

        assert!(!Error::FrameTooLarge.is_disconnect());
        assert!(!Error::ServerClosed.is_disconnect());
        let timeout = Error::Io(io::ErrorKind::TimedOut.into());
        assert!(!timeout.is_disconnect());
    }

    #[test]
    fn error_messages() {
        assert_eq!(Error::FrameTooLarge.to_string(), "tcp: frame too large");
        assert_eq!(Error::FrameFlags.to_string(), "tcp: frame flags error");
        assert_eq!(Error::ServerClosed.to_string(), "tcp: server closed");
    }
}
