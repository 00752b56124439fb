//! A TCP application server for length-prefixed, payload-agnostic messages.
//!
//! Clients hold long-lived connections and exchange framed requests and
//! responses. Each DATA frame carries a `{type_url, value}` envelope; the
//! type url selects a registered handler chain, middleware included, and
//! the handler's response is written back on the same connection.
//!
//! ```rust,no_run
//! use gantry::{handlers, BinaryCodec, Context, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> gantry::Result<()> {
//!     let mut router = Router::default_router();
//!     router.handle("pb.Ping", handlers![|c: &mut Context<'_>| {
//!         let _ = c.write_any("pb.Ping", &b"Pong"[..]);
//!     }]);
//!
//!     let server = Server::builder(router, BinaryCodec)
//!         .addr("127.0.0.1:8202")
//!         .build();
//!     server.listen_and_serve().await
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod context;
pub mod error;
pub mod frame;
pub mod group;
pub mod recovery;
pub mod response;
pub mod router;
pub mod server;

mod bufpool;
mod util;

#[cfg(test)]
mod test_support;

pub use codec::{BinaryCodec, Codec, CodecError, Envelope, JsonCodec, Request};
pub use connection::ConnState;
pub use context::{AttachedError, Context, ErrorScope, Value, ABORT_INDEX, ERROR_TYPE_URL};
pub use error::{Error, Result};
pub use frame::{Flags, FrameHeader, FrameType, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
pub use group::Group;
pub use recovery::{recovery, AbortHandler};
pub use response::{ResponseWriter, DEFAULT_STATUS};
pub use router::{HandlerFn, RouteInfo, Router};
pub use server::{ConnStateHook, Handler, Server, ServerBuilder};

/// Boxed error carried by `Context::error` attachments.
///
/// Handlers attach whatever error type they have; boxing keeps the hot
/// dispatch path free of generic machinery while still preserving the
/// source error for middleware that wants to downcast.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
