// ABOUTME: Recovery middleware: traps panics below it in the chain
// ABOUTME: Broken-pipe panics close quietly; everything else logs a backtrace and maps to 500

use std::any::Any;
use std::backtrace::Backtrace;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::context::Context;
use crate::response::DEFAULT_STATUS;
use crate::router::HandlerFn;

/// Sentinel panic value: raise with `std::panic::panic_any(AbortHandler)`
/// to unwind out of a handler without a stack trace being logged.
pub struct AbortHandler;

/// Middleware that traps any panic raised further down the chain.
///
/// Install first (`Router::default_router` does) so the whole chain is
/// covered. After recovery the connection keeps serving unless the panic
/// indicated the peer is gone.
pub fn recovery() -> HandlerFn {
    HandlerFn::new(|c: &mut Context<'_>| {
        let outcome = catch_unwind(AssertUnwindSafe(|| c.next()));
        if let Err(payload) = outcome {
            recover(c, payload);
        }
    })
}

fn recover(c: &mut Context<'_>, payload: Box<dyn Any + Send>) {
    if payload.downcast_ref::<AbortHandler>().is_some() {
        c.abort();
        return;
    }

    let msg = panic_message(payload.as_ref());
    if is_connection_broken(payload.as_ref(), &msg) {
        // the peer is gone; nothing useful to trace
        tracing::error!(target: "gantry::recovery", error = %msg, "connection broken during handler");
        if c.status() == DEFAULT_STATUS && c.buffered() == 0 {
            c.set_status(204);
        }
        c.set_keep_alive(false);
        c.abort();
        return;
    }

    let backtrace = Backtrace::force_capture();
    tracing::error!(target: "gantry::recovery", panic = %msg, %backtrace, "panic recovered");
    c.abort_with_status(500);
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<io::Error>() {
        err.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

fn is_connection_broken(payload: &(dyn Any + Send), msg: &str) -> bool {
    if let Some(err) = payload.downcast_ref::<io::Error>() {
        if matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        ) {
            return true;
        }
    }
    let msg = msg.to_ascii_lowercase();
    msg.contains("broken pipe") || msg.contains("connection reset by peer")
}
