// ABOUTME: Demonstrates graceful shutdown: serve until ctrl-c, then drain connections

use std::time::Duration;

use argh::FromArgs;
use gantry::{handlers, BinaryCodec, Context, Router, Server};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Framed server that drains cleanly on ctrl-c
#[derive(FromArgs)]
struct CliArgs {
    /// listen address (default: 127.0.0.1:8202)
    #[argh(option)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> gantry::Result<()> {
    let args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing subscriber failed");

    let mut router = Router::default_router();
    router.handle(
        "pb.Ping",
        handlers![|c: &mut Context<'_>| {
            let _ = c.write_any("pb.Ping", &b"Pong"[..]);
        }],
    );

    let server = Server::builder(router, BinaryCodec)
        .addr(args.addr.unwrap_or_else(|| "127.0.0.1:8202".to_string()))
        .idle_timeout(Duration::from_secs(60))
        .conn_state(|addr, state| info!(%addr, %state, "connection state"))
        .build();

    server.register_on_shutdown(|| info!("shutdown started"));

    let serve = tokio::spawn(server.clone().listen_and_serve());
    info!(addr = server.addr(), "serving; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("draining connections");
    server.shutdown().await?;

    match serve.await {
        Ok(result) => info!(?result, "serve finished"),
        Err(err) => info!(%err, "serve task failed"),
    }
    Ok(())
}
