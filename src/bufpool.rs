// ABOUTME: Process-wide pool of socket staging buffers
// ABOUTME: Buffers are acquired when a connection starts serving and returned on every exit path

use std::sync::Mutex;

use bytes::BytesMut;
use once_cell::sync::Lazy;

/// Initial capacity of pooled read/write buffers. Real deployments may want
/// a larger value; a buffer keeps whatever capacity it grew to while in use.
const BUF_CAPACITY: usize = 4 * 1024;

/// Retention bound so a connection spike does not pin memory forever.
const MAX_POOLED: usize = 64;

static POOL: Lazy<Mutex<Vec<BytesMut>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Take a cleared buffer from the pool, or allocate a fresh one.
pub(crate) fn get() -> BytesMut {
    let mut pool = POOL.lock().expect("buffer pool poisoned");
    pool.pop()
        .unwrap_or_else(|| BytesMut::with_capacity(BUF_CAPACITY))
}

/// Return a buffer for a future connection. The caller must no longer hold
/// any view into it; contents are discarded here.
pub(crate) fn put(mut buf: BytesMut) {
    buf.clear();
    let mut pool = POOL.lock().expect("buffer pool poisoned");
    if pool.len() < MAX_POOLED {
        pool.push(buf);
    }
}
