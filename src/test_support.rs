// ABOUTME: Shared helpers for unit tests: one-off writers, requests and contexts

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::codec::{BinaryCodec, Request};
use crate::context::{Context, ContextSlot};
use crate::response::ResponseWriter;
use crate::router::Router;

pub(crate) fn writer() -> ResponseWriter {
    ResponseWriter::new(BytesMut::new(), Arc::new(BinaryCodec))
}

pub(crate) fn request(type_url: &str, data: &[u8]) -> Request {
    Request {
        type_url: type_url.to_string(),
        data: Bytes::copy_from_slice(data),
        remote_addr: None,
    }
}

/// Dispatch through the router, returning the status and buffered response.
pub(crate) fn dispatch(router: &Router, type_url: &str, data: &[u8]) -> (u16, BytesMut) {
    let mut w = writer();
    dispatch_with_writer(router, type_url, data, &mut w);
    let status = w.status();
    (status, w.into_buf())
}

pub(crate) fn dispatch_with_writer(
    router: &Router,
    type_url: &str,
    data: &[u8],
    w: &mut ResponseWriter,
) {
    let req = request(type_url, data);
    router.serve_proto(w, &req);
}

/// Run `f` inside a detached context bound to `router`.
pub(crate) fn run_with_context<R>(
    router: &Router,
    type_url: &str,
    f: impl FnOnce(&mut Context<'_>) -> R,
) -> R {
    let mut w = writer();
    let req = request(type_url, b"");
    let mut c = Context {
        router,
        writer: &mut w,
        request: &req,
        slot: ContextSlot::default(),
        index: -1,
    };
    f(&mut c)
}
