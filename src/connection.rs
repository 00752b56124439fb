// ABOUTME: Per-connection serve loop: read frames, dispatch, flush, track state
// ABOUTME: State lives in one packed atomic word readable by the shutdown scanner

use std::fmt;
use std::io;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::bufpool;
use crate::codec::Request;
use crate::error::{Error, Result};
use crate::frame::{self, FrameType, FRAME_HEADER_LEN};
use crate::recovery::{panic_message, AbortHandler};
use crate::response::ResponseWriter;
use crate::server::Server;

/// Observable lifecycle of one client connection.
///
/// Valid sequences are a prefix of `New (Active Idle)* Closed`. `Closed`
/// fires exactly once, after the socket is closed and buffers returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Active = 1,
    Idle = 2,
    #[num_enum(default)]
    Closed = 3,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The connection record the server tracks: identity, packed state word
/// and the close signal the shutdown paths use.
pub(crate) struct ConnShared {
    pub(crate) id: u64,
    // packed (unix_seconds << 8) | state
    state: AtomicU64,
    closed: AtomicBool,
    close: Notify,
    pub(crate) remote_addr: std::net::SocketAddr,
}

impl ConnShared {
    pub(crate) fn new(id: u64, remote_addr: std::net::SocketAddr) -> ConnShared {
        ConnShared {
            id,
            state: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close: Notify::new(),
            remote_addr,
        }
    }

    /// Tell the serve loop to stop. The flag is sticky so the loop can
    /// also poll it between already-buffered frames, where it never awaits
    /// the notify.
    pub(crate) fn signal_close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close.notify_one();
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn close_notified(&self) {
        self.close.notified().await;
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        let packed = (unix_now() as u64) << 8 | u64::from(u8::from(state));
        self.state.store(packed, Ordering::Release);
    }

    pub(crate) fn get_state(&self) -> (ConnState, i64) {
        let packed = self.state.load(Ordering::Acquire);
        (ConnState::from((packed & 0xff) as u8), (packed >> 8) as i64)
    }

    #[cfg(test)]
    pub(crate) fn set_state_at(&self, state: ConnState, unix_sec: i64) {
        let packed = (unix_sec as u64) << 8 | u64::from(u8::from(state));
        self.state.store(packed, Ordering::Release);
    }
}

/// One accepted connection, owned by its serve task.
pub(crate) struct Conn {
    pub(crate) server: Arc<Server>,
    pub(crate) shared: Arc<ConnShared>,
    pub(crate) stream: TcpStream,
}

impl Conn {
    /// Serve the connection until EOF, a fatal error, a non-keep-alive
    /// response, or a close signal. Every exit path closes the socket,
    /// returns both buffers and emits `Closed` exactly once.
    pub(crate) async fn serve(self) {
        let Conn {
            server,
            shared,
            mut stream,
        } = self;
        let remote = shared.remote_addr;

        let mut rbuf = bufpool::get();
        let mut wbuf = bufpool::get();

        let outcome = run(&server, &shared, &mut stream, &mut rbuf, &mut wbuf).await;

        if let Err(err) = &outcome {
            if err.is_disconnect() {
                tracing::debug!(target: "gantry::connection", %remote, error = %err, "connection dropped");
            } else {
                tracing::error!(target: "gantry::connection", %remote, error = %err, "connection failed");
            }
        }

        // best-effort: flush whatever is still buffered, then close; an
        // abrupt close drops buffered data instead of risking a stall
        if !wbuf.is_empty() && !shared.close_requested() {
            if let Err(err) = stream.write_all_buf(&mut wbuf).await {
                tracing::debug!(target: "gantry::connection", %remote, error = %err, "final flush failed");
            }
        }
        let _ = stream.shutdown().await;

        bufpool::put(rbuf);
        bufpool::put(wbuf);

        server.set_conn_state(&shared, ConnState::Closed);
    }
}

async fn run(
    server: &Arc<Server>,
    shared: &Arc<ConnShared>,
    stream: &mut TcpStream,
    rbuf: &mut BytesMut,
    wbuf: &mut BytesMut,
) -> Result<()> {
    let remote = shared.remote_addr;

    loop {
        // buffered frames must not outlive a close request
        if shared.close_requested() {
            return Ok(());
        }

        // wait until a valid header is buffered
        let fh = loop {
            if let Some(fh) = frame::check(rbuf)? {
                break fh;
            }
            // between frames the idle deadline applies; mid-header the
            // stricter read deadline takes over
            let wait = if rbuf.is_empty() {
                server.idle_timeout()
            } else {
                server.read_timeout()
            };
            let n = tokio::select! {
                _ = shared.close_notified() => return Ok(()),
                res = read_some(stream, rbuf, wait) => res?,
            };
            if n == 0 {
                if rbuf.is_empty() {
                    return Ok(());
                }
                // peer closed mid-frame
                return Err(Error::Io(io::ErrorKind::ConnectionReset.into()));
            }
        };

        // the first bytes of a valid frame make the connection active,
        // even while a slow body is still arriving
        server.set_conn_state(shared, ConnState::Active);

        while !frame::body_complete(rbuf, fh) {
            let n = tokio::select! {
                _ = shared.close_notified() => return Ok(()),
                res = read_some(stream, rbuf, server.read_timeout()) => res?,
            };
            if n == 0 {
                return Err(Error::Io(io::ErrorKind::ConnectionReset.into()));
            }
        }

        rbuf.advance(FRAME_HEADER_LEN);
        let body = rbuf.split_to(fh.length as usize).freeze();

        if fh.frame_type == FrameType::Data && !body.is_empty() {
            let envelope = server.codec().decode(&body).map_err(Error::CodecDecode)?;
            let request = Request::new(envelope, Some(remote));

            let mut writer = ResponseWriter::new(mem::take(wbuf), server.codec());
            let dispatch = catch_unwind(AssertUnwindSafe(|| {
                server.handler().dispatch(&mut writer, &request)
            }));
            let keep_alive = writer.keep_alive();
            *wbuf = writer.into_buf();

            if let Err(payload) = dispatch {
                // a panic that escaped the handler chain fails the connection
                if payload.downcast_ref::<AbortHandler>().is_none() && !server.shutting_down() {
                    let backtrace = std::backtrace::Backtrace::force_capture();
                    tracing::error!(
                        target: "gantry::connection",
                        %remote,
                        panic = %panic_message(payload.as_ref()),
                        %backtrace,
                        "panic serving connection"
                    );
                }
                return Ok(());
            }

            if !wbuf.is_empty() {
                // an abrupt close must also unblock a stalled flush
                tokio::select! {
                    _ = shared.close_notified() => return Ok(()),
                    res = flush(stream, wbuf, server.write_timeout()) => res?,
                }
            }

            if !keep_alive {
                return Ok(());
            }
        } else if fh.frame_type != FrameType::Data && !body.is_empty() {
            tracing::debug!(
                target: "gantry::connection",
                %remote,
                frame_type = %fh.frame_type,
                len = body.len(),
                "discarding non-DATA frame body"
            );
        }

        server.set_conn_state(shared, ConnState::Idle);
    }
}

async fn read_some(stream: &mut TcpStream, buf: &mut BytesMut, wait: Duration) -> Result<usize> {
    if wait.is_zero() {
        return Ok(stream.read_buf(buf).await?);
    }
    match tokio::time::timeout(wait, stream.read_buf(buf)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(Error::Io(io::ErrorKind::TimedOut.into())),
    }
}

async fn flush(stream: &mut TcpStream, buf: &mut BytesMut, wait: Duration) -> Result<()> {
    if wait.is_zero() {
        stream.write_all_buf(buf).await?;
        return Ok(());
    }
    match tokio::time::timeout(wait, stream.write_all_buf(buf)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(Error::Io(io::ErrorKind::TimedOut.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_word_packs_time_and_state() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let shared = ConnShared::new(7, addr);

        let (state, unix_sec) = shared.get_state();
        assert_eq!(state, ConnState::New);
        assert_eq!(unix_sec, 0);

        let before = unix_now();
        shared.set_state(ConnState::Idle);
        let (state, unix_sec) = shared.get_state();
        assert_eq!(state, ConnState::Idle);
        assert!(unix_sec >= before);

        shared.set_state(ConnState::Closed);
        assert_eq!(shared.get_state().0, ConnState::Closed);
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnState::New.to_string(), "new");
        assert_eq!(ConnState::Active.to_string(), "active");
        assert_eq!(ConnState::Idle.to_string(), "idle");
        assert_eq!(ConnState::Closed.to_string(), "closed");
    }

    #[test]
    fn unknown_state_bytes_collapse_to_closed() {
        assert_eq!(ConnState::from(0xffu8), ConnState::Closed);
    }
}
