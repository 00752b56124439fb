// ABOUTME: Minimal echo server: answers pb.Ping with Pong and echoes echo.Message bodies

use argh::FromArgs;
use gantry::{handlers, BinaryCodec, Context, Router, Server};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Framed echo server
#[derive(FromArgs)]
struct CliArgs {
    /// listen address (default: 127.0.0.1:8202)
    #[argh(option)]
    addr: Option<String>,

    /// enable debug logging
    #[argh(switch, short = 'd')]
    debug: bool,
}

#[tokio::main]
async fn main() -> gantry::Result<()> {
    let args: CliArgs = argh::from_env();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing subscriber failed");

    let mut router = Router::default_router();
    router.handle(
        "pb.Ping",
        handlers![|c: &mut Context<'_>| {
            info!(from = ?c.remote_addr(), "ping");
            let _ = c.write_any("pb.Ping", &b"Pong"[..]);
        }],
    );
    router.handle(
        "echo.Message",
        handlers![|c: &mut Context<'_>| {
            let _ = c.write_any("echo.Message", c.data().to_vec());
        }],
    );

    let server = Server::builder(router, BinaryCodec)
        .addr(args.addr.unwrap_or_else(|| "127.0.0.1:8202".to_string()))
        .build();

    info!(addr = server.addr(), "serving");
    server.listen_and_serve().await
}
