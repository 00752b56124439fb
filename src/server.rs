// ABOUTME: Server: listener multiplexing, accept loop with backoff, graceful shutdown
// ABOUTME: Connections and listeners are tracked under one mutex; quiescence is polled

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::codec::{Codec, Request};
use crate::connection::{unix_now, Conn, ConnShared, ConnState};
use crate::error::{Error, Result};
use crate::response::ResponseWriter;

/// Application seam between the connection loop and the router.
pub trait Handler: Send + Sync {
    fn dispatch(&self, writer: &mut ResponseWriter, request: &Request);
}

/// Hook observing connection state transitions, e.g. for metrics.
pub type ConnStateHook = dyn Fn(SocketAddr, ConnState) + Send + Sync;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How often the shutdown poller scans for quiescence.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A `New` connection making no progress for this long is treated as idle
/// by the quiescence scan.
const STALE_NEW_SECS: i64 = 5;

struct ServerInner {
    listeners: HashSet<u64>,
    active_conn: HashMap<u64, Arc<ConnShared>>,
    on_shutdown: Vec<Arc<dyn Fn() + Send + Sync>>,
}

/// TCP server for framed messages.
///
/// Configure through [`Server::builder`], then run any number of
/// `serve`/`listen_and_serve` tasks against it. `shutdown` drains
/// gracefully, `close` drops everything at once.
pub struct Server {
    addr: String,
    handler: Arc<dyn Handler>,
    codec: Arc<dyn Codec>,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    shutdown_poll_interval: Duration,
    conn_state: Option<Box<ConnStateHook>>,
    in_shutdown: AtomicBool,
    next_id: AtomicU64,
    inner: Mutex<ServerInner>,
    done_tx: watch::Sender<bool>,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    addr: String,
    handler: Arc<dyn Handler>,
    codec: Arc<dyn Codec>,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    shutdown_poll_interval: Duration,
    conn_state: Option<Box<ConnStateHook>>,
}

impl ServerBuilder {
    /// Address used by `listen_and_serve`.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Deadline for completing a partially received frame. Zero disables.
    pub fn read_timeout(mut self, d: Duration) -> Self {
        self.read_timeout = d;
        self
    }

    /// Deadline for flushing a response. Zero disables.
    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = d;
        self
    }

    /// Deadline for the next frame to start arriving. Zero falls back to
    /// the read timeout.
    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    /// How often `shutdown` rescans for quiescence. Mainly lowered in
    /// tests to keep them fast.
    pub fn shutdown_poll_interval(mut self, d: Duration) -> Self {
        self.shutdown_poll_interval = d;
        self
    }

    /// Observe per-connection state transitions.
    pub fn conn_state(mut self, hook: impl Fn(SocketAddr, ConnState) + Send + Sync + 'static) -> Self {
        self.conn_state = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Arc<Server> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Server {
            addr: self.addr,
            handler: self.handler,
            codec: self.codec,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
            shutdown_poll_interval: self.shutdown_poll_interval,
            conn_state: self.conn_state,
            in_shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            inner: Mutex::new(ServerInner {
                listeners: HashSet::new(),
                active_conn: HashMap::new(),
                on_shutdown: Vec::new(),
            }),
            done_tx,
        })
    }
}

impl Server {
    pub fn builder(handler: impl Handler + 'static, codec: impl Codec + 'static) -> ServerBuilder {
        ServerBuilder {
            addr: "127.0.0.1:8202".to_string(),
            handler: Arc::new(handler),
            codec: Arc::new(codec),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            shutdown_poll_interval: SHUTDOWN_POLL_INTERVAL,
            conn_state: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Bind the configured address and serve it.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        tracing::debug!(target: "gantry::server", addr = %self.addr, "listening");
        self.serve(listener).await
    }

    /// Accept connections on `listener` until a fatal error or shutdown.
    ///
    /// Returns `Error::ServerClosed` once `shutdown` or `close` has been
    /// called. Several listeners may be served concurrently against one
    /// server.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        // subscribe before tracking so a concurrent shutdown is never missed
        let mut done = self.done_tx.subscribe();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.track_listener(id, true) {
            return Err(Error::ServerClosed);
        }
        let result = Server::accept_loop(&self, &listener, &mut done).await;
        self.track_listener(id, false);
        result
    }

    async fn accept_loop(
        server: &Arc<Server>,
        listener: &TcpListener,
        done: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut delay = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                _ = done.changed() => return Err(Error::ServerClosed),
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, remote_addr)) => {
                    delay = Duration::ZERO;
                    let shared = Arc::new(ConnShared::new(
                        server.next_id.fetch_add(1, Ordering::Relaxed),
                        remote_addr,
                    ));
                    // track + mark New before the serve task can observe anything
                    server.set_conn_state(&shared, ConnState::New);
                    let conn = Conn {
                        server: server.clone(),
                        shared,
                        stream,
                    };
                    tokio::spawn(conn.serve());
                }
                Err(err) => {
                    if server.shutting_down() {
                        return Err(Error::ServerClosed);
                    }
                    if is_temporary(&err) {
                        delay = if delay.is_zero() {
                            ACCEPT_BACKOFF_START
                        } else {
                            (delay * 2).min(ACCEPT_BACKOFF_MAX)
                        };
                        tracing::warn!(target: "gantry::server", error = %err, ?delay, "accept error; retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(Error::Io(err));
                }
            }
        }
    }

    /// Gracefully shut down: stop accepting, then close connections as
    /// they go idle, polling until none remain. In-flight handlers are
    /// allowed to complete.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::debug!(target: "gantry::server", "starting shutdown");
        self.in_shutdown.store(true, Ordering::SeqCst);

        let callbacks = {
            let mut inner = self.inner.lock().expect("server state poisoned");
            inner.listeners.clear();
            inner.on_shutdown.clone()
        };
        let _ = self.done_tx.send(true);
        for f in callbacks {
            tokio::spawn(async move { f() });
        }

        loop {
            if self.close_idle_conns() {
                tracing::debug!(target: "gantry::server", "shutdown complete");
                return Ok(());
            }
            tracing::debug!(
                target: "gantry::server",
                waiting = self.active_connections(),
                "waiting on connections"
            );
            tokio::time::sleep(self.shutdown_poll_interval).await;
        }
    }

    /// Abrupt shutdown: stop accepting and signal every connection to
    /// close regardless of state. Does not wait for them to finish.
    pub fn close(&self) -> Result<()> {
        self.in_shutdown.store(true, Ordering::SeqCst);
        let conns: Vec<Arc<ConnShared>> = {
            let mut inner = self.inner.lock().expect("server state poisoned");
            inner.listeners.clear();
            inner.active_conn.values().cloned().collect()
        };
        let _ = self.done_tx.send(true);
        for conn in conns {
            conn.signal_close();
        }
        Ok(())
    }

    /// Register a callback run concurrently when `shutdown` begins.
    pub fn register_on_shutdown(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner
            .lock()
            .expect("server state poisoned")
            .on_shutdown
            .push(Arc::new(f));
    }

    /// Number of connections currently tracked (any state before Closed).
    pub fn active_connections(&self) -> usize {
        self.inner
            .lock()
            .expect("server state poisoned")
            .active_conn
            .len()
    }

    pub fn shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    /// Signal idle connections to close; true once none are tracked.
    fn close_idle_conns(&self) -> bool {
        let inner = self.inner.lock().expect("server state poisoned");
        let now = unix_now();
        for conn in inner.active_conn.values() {
            let (mut state, unix_sec) = conn.get_state();
            // a New connection that never progressed counts as idle
            if state == ConnState::New && unix_sec < now - STALE_NEW_SECS {
                state = ConnState::Idle;
            }
            if state != ConnState::Idle || unix_sec == 0 {
                continue;
            }
            conn.signal_close();
        }
        inner.active_conn.is_empty()
    }

    fn track_listener(&self, id: u64, add: bool) -> bool {
        let mut inner = self.inner.lock().expect("server state poisoned");
        if add {
            if self.shutting_down() {
                return false;
            }
            inner.listeners.insert(id);
        } else {
            inner.listeners.remove(&id);
        }
        true
    }

    pub(crate) fn set_conn_state(&self, shared: &Arc<ConnShared>, state: ConnState) {
        match state {
            ConnState::New => {
                self.inner
                    .lock()
                    .expect("server state poisoned")
                    .active_conn
                    .insert(shared.id, shared.clone());
            }
            ConnState::Closed => {
                self.inner
                    .lock()
                    .expect("server state poisoned")
                    .active_conn
                    .remove(&shared.id);
            }
            _ => {}
        }
        shared.set_state(state);
        if let Some(hook) = &self.conn_state {
            hook(shared.remote_addr, state);
        }
    }

    pub(crate) fn codec(&self) -> Arc<dyn Codec> {
        self.codec.clone()
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub(crate) fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Idle deadline, falling back to the read deadline when unset.
    pub(crate) fn idle_timeout(&self) -> Duration {
        if !self.idle_timeout.is_zero() {
            self.idle_timeout
        } else {
            self.read_timeout
        }
    }
}

fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
