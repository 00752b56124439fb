// ABOUTME: Per-request context: handler chain cursor, key/value scratch, attached errors
// ABOUTME: Slots are pooled by the router and reset on every acquire

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use bytes::Bytes;

use crate::codec::{Envelope, Request};
use crate::error::Result;
use crate::response::ResponseWriter;
use crate::router::{HandlerFn, Router};
use crate::BoxError;

/// Sentinel index bounding the handler chain; `abort` jumps the cursor
/// here so the dispatch loop stops after the current handler returns.
pub const ABORT_INDEX: i8 = i8::MAX / 2;

/// Type url used by `write_error` for textual error payloads.
pub const ERROR_TYPE_URL: &str = "gantry.Error";

/// A value stored in the context's key/value scratch space.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Bytes),
    Time(SystemTime),
    Duration(Duration),
    StringList(Vec<String>),
    Map(HashMap<String, Value>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Value {
        Value::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(Bytes::from(v))
    }
}

impl From<SystemTime> for Value {
    fn from(v: SystemTime) -> Value {
        Value::Time(v)
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Value {
        Value::Duration(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Value {
        Value::StringList(v)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(v: HashMap<String, Value>) -> Value {
        Value::Map(v)
    }
}

bitflags! {
    /// Classification of an attached error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorScope: u64 {
        const PRIVATE = 1 << 0;
        const PUBLIC = 1 << 1;
        const ANY = u64::MAX;
    }
}

/// One error a handler attached to the context for observability.
/// Attached errors never change the response by themselves.
#[derive(Debug)]
pub struct AttachedError {
    pub error: BoxError,
    pub scope: ErrorScope,
}

impl AttachedError {
    pub fn is_scope(&self, scope: ErrorScope) -> bool {
        self.scope.intersects(scope)
    }
}

/// The allocation-carrying parts of a context, pooled across dispatches.
#[derive(Default)]
pub(crate) struct ContextSlot {
    pub(crate) handlers: Vec<HandlerFn>,
    pub(crate) full_path: String,
    pub(crate) keys: HashMap<String, Value>,
    pub(crate) errors: Vec<AttachedError>,
}

impl ContextSlot {
    pub(crate) fn reset(&mut self) {
        self.handlers.clear();
        self.full_path.clear();
        self.keys.clear();
        self.errors.clear();
    }
}

/// Carries one request through its middleware chain and terminal handler.
///
/// Middleware calls `next` to run the rest of the chain inside itself, and
/// `abort` to stop anything later in the chain from running. Arbitrary
/// values can be parked under string keys for downstream handlers.
pub struct Context<'a> {
    pub(crate) router: &'a Router,
    pub(crate) writer: &'a mut ResponseWriter,
    pub(crate) request: &'a Request,
    pub(crate) slot: ContextSlot,
    pub(crate) index: i8,
}

impl<'a> Context<'a> {
    /* ---------- flow control ---------- */

    /// Run the pending handlers in the chain. Only meaningful inside
    /// middleware; a handler calling it runs everything downstream of
    /// itself before regaining control.
    pub fn next(&mut self) {
        self.index += 1;
        while (self.index as usize) < self.slot.handlers.len() {
            let handler = self.slot.handlers[self.index as usize].clone();
            handler.call(self);
            self.index += 1;
        }
    }

    /// Prevent pending handlers from running. Does not stop the current one.
    pub fn abort(&mut self) {
        self.index = ABORT_INDEX;
    }

    /// `abort` plus a response status, the usual rejection shorthand.
    pub fn abort_with_status(&mut self, status: u16) {
        self.writer.set_status(status);
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.index >= ABORT_INDEX
    }

    /* ---------- request views ---------- */

    /// Raw payload bytes of the request.
    pub fn data(&self) -> &[u8] {
        &self.request.data
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.request.remote_addr
    }

    /// Matched route's display path; empty for unrouted requests.
    pub fn full_path(&self) -> &str {
        &self.slot.full_path
    }

    /// Name of the terminal handler of the matched chain.
    pub fn handler_name(&self) -> &'static str {
        self.slot.handlers.last().map_or("", HandlerFn::name)
    }

    /// Names of every handler in the chain, in dispatch order.
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.slot.handlers.iter().map(HandlerFn::name).collect()
    }

    pub(crate) fn router(&self) -> &'a Router {
        self.router
    }

    /* ---------- response ---------- */

    pub fn set_status(&mut self, code: u16) {
        self.writer.set_status(code);
    }

    pub fn status(&self) -> u16 {
        self.writer.status()
    }

    pub fn keep_alive(&self) -> bool {
        self.writer.keep_alive()
    }

    pub fn set_keep_alive(&mut self, value: bool) {
        self.writer.set_keep_alive(value);
    }

    /// Response bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.writer.buffered()
    }

    /// Frame an envelope into the response.
    pub fn write(&mut self, envelope: &Envelope) -> Result<()> {
        self.writer.write(envelope)
    }

    /// Wrap already-encoded message bytes under `type_url` and write them.
    pub fn write_any(&mut self, type_url: &str, value: impl Into<Bytes>) -> Result<()> {
        self.write(&Envelope::new(type_url, value))
    }

    /// Set `status` and write a textual error payload.
    pub fn write_error(&mut self, status: u16, msg: &str) -> Result<()> {
        self.writer.set_status(status);
        self.write_any(ERROR_TYPE_URL, msg.as_bytes().to_vec())
    }

    /* ---------- error management ---------- */

    /// Attach an error to the context. Errors accumulate in order and can
    /// be collected by middleware for logging or reporting.
    pub fn error(&mut self, err: impl Into<BoxError>) {
        self.error_scoped(err, ErrorScope::PRIVATE);
    }

    pub fn error_scoped(&mut self, err: impl Into<BoxError>, scope: ErrorScope) {
        self.slot.errors.push(AttachedError {
            error: err.into(),
            scope,
        });
    }

    pub fn errors(&self) -> &[AttachedError] {
        &self.slot.errors
    }

    pub fn last_error(&self) -> Option<&AttachedError> {
        self.slot.errors.last()
    }

    pub fn errors_by_scope(&self, scope: ErrorScope) -> Vec<&AttachedError> {
        self.slot
            .errors
            .iter()
            .filter(|e| e.is_scope(scope))
            .collect()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.slot.errors.iter().map(|e| e.error.to_string()).collect()
    }

    /* ---------- key/value scratch ---------- */

    /// Store a value under `key` exclusively for this request.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.slot.keys.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.slot.keys.get(key)
    }

    /// Like `get`, but panics when the key is missing.
    pub fn must_get(&self, key: &str) -> &Value {
        match self.get(key) {
            Some(value) => value,
            None => panic!("key {key:?} does not exist"),
        }
    }

    pub fn get_string(&self, key: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(Value::Int(i)) => *i,
            _ => 0,
        }
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        match self.get(key) {
            Some(Value::Float(f)) => *f,
            _ => 0.0,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Bytes {
        match self.get(key) {
            Some(Value::Bytes(b)) => b.clone(),
            _ => Bytes::new(),
        }
    }

    pub fn get_time(&self, key: &str) -> SystemTime {
        match self.get(key) {
            Some(Value::Time(t)) => *t,
            _ => SystemTime::UNIX_EPOCH,
        }
    }

    pub fn get_duration(&self, key: &str) -> Duration {
        match self.get(key) {
            Some(Value::Duration(d)) => *d,
            _ => Duration::ZERO,
        }
    }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::StringList(l)) => l.clone(),
            _ => Vec::new(),
        }
    }

    pub fn get_map(&self, key: &str) -> HashMap<String, Value> {
        match self.get(key) {
            Some(Value::Map(m)) => m.clone(),
            _ => HashMap::new(),
        }
    }

    /* ---------- internals ---------- */

    pub(crate) fn reset(&mut self) {
        self.slot.reset();
        self.index = -1;
    }

    pub(crate) fn into_slot(self) -> ContextSlot {
        self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use crate::test_support::run_with_context;

    #[test]
    fn keys_roundtrip_through_value_union() {
        let router = Router::new();
        run_with_context(&router, "pb.Test", |c| {
            c.set("s", "hello");
            c.set("i", 42i64);
            c.set("f", 1.5f64);
            c.set("b", true);
            c.set("bytes", vec![1u8, 2, 3]);
            c.set("d", Duration::from_millis(250));
            c.set("list", vec!["a".to_string(), "b".to_string()]);

            assert_eq!(c.get_string("s"), "hello");
            assert_eq!(c.get_i64("i"), 42);
            assert_eq!(c.get_f64("f"), 1.5);
            assert!(c.get_bool("b"));
            assert_eq!(c.get_bytes("bytes").as_ref(), &[1, 2, 3]);
            assert_eq!(c.get_duration("d"), Duration::from_millis(250));
            assert_eq!(c.get_string_list("list"), vec!["a", "b"]);
        });
    }

    #[test]
    fn typed_getters_return_zero_values_on_mismatch() {
        let router = Router::new();
        run_with_context(&router, "pb.Test", |c| {
            c.set("s", "not a number");
            assert_eq!(c.get_i64("s"), 0);
            assert_eq!(c.get_f64("s"), 0.0);
            assert!(!c.get_bool("s"));
            assert_eq!(c.get_string("missing"), "");
            assert_eq!(c.get_duration("missing"), Duration::ZERO);
            assert_eq!(c.get_time("missing"), SystemTime::UNIX_EPOCH);
            assert!(c.get_string_list("missing").is_empty());
            assert!(c.get_map("missing").is_empty());
        });
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn must_get_panics_on_missing_key() {
        let router = Router::new();
        run_with_context(&router, "pb.Test", |c| {
            c.must_get("nope");
        });
    }

    #[test]
    fn attached_errors_accumulate_in_order() {
        let router = Router::new();
        run_with_context(&router, "pb.Test", |c| {
            c.error("first");
            c.error_scoped("second", ErrorScope::PUBLIC);
            c.error("third");

            assert_eq!(c.error_messages(), vec!["first", "second", "third"]);
            assert_eq!(c.last_error().unwrap().error.to_string(), "third");
            assert_eq!(c.errors_by_scope(ErrorScope::PUBLIC).len(), 1);
            assert_eq!(c.errors_by_scope(ErrorScope::PRIVATE).len(), 2);
            assert_eq!(c.errors_by_scope(ErrorScope::ANY).len(), 3);
        });
    }

    #[test]
    fn abort_is_observable() {
        let router = Router::new();
        run_with_context(&router, "pb.Test", |c| {
            assert!(!c.is_aborted());
            c.abort_with_status(400);
            assert!(c.is_aborted());
            assert_eq!(c.status(), 400);
        });
    }

    #[test]
    fn write_error_sets_status_and_payload() {
        let router = Router::new();
        run_with_context(&router, "pb.Test", |c| {
            c.write_error(404, "route not found").unwrap();
            assert_eq!(c.status(), 404);
            assert!(c.buffered() > 0);
        });
    }

    #[test]
    fn write_any_buffers_a_framed_response() {
        let router = Router::new();
        run_with_context(&router, "pb.Test", |c| {
            assert_eq!(c.buffered(), 0);
            c.write_any("pb.Pong", &b"pong"[..]).unwrap();
            assert!(c.buffered() > crate::frame::FRAME_HEADER_LEN);
        });
    }
}
