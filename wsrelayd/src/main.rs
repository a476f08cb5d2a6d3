use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::{net::TcpListener, runtime};
use tokio_util::sync::CancellationToken;
use wsrelay::{
    app::{BroadcastLogger, SignalingRelay},
    http::{self, HttpConfig},
    tls, HandlerFactory, Options, WebSocketServer,
};

/// WebSocket relay server.
///
/// Serves static files from a resources directory and upgrades requests on `/upgrade` to
/// WebSocket connections handled by the selected application.
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Directory served for plain HTTP requests.
    #[arg(short, long, default_value = "./resources")]
    resources: PathBuf,

    /// Application run on every WebSocket connection.
    #[arg(short, long, value_enum, default_value_t = App::Signaling)]
    app: App,

    /// PEM certificate chain. Enables TLS together with --tls-key.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Close peers silent for this long, e.g. "30s" or "5m". Disabled when omitted.
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// HTTP requests served concurrently.
    #[arg(long, default_value_t = 20)]
    max_requests: usize,

    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

#[derive(Copy, Clone, ValueEnum)]
enum App {
    /// WebRTC signaling relay.
    Signaling,
    /// Logs traffic and relays text to every other peer.
    Broadcast,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    simple_logger::SimpleLogger::new()
        .with_level(cli.log_level)
        .init()
        .context("logger")?;

    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?;

    match cli.app {
        App::Signaling => runtime.block_on(run(cli, SignalingRelay::new)),
        App::Broadcast => runtime.block_on(run(cli, BroadcastLogger::new)),
    }
}

async fn run<F: HandlerFactory>(cli: Cli, factory: F) -> anyhow::Result<()> {
    let options = match cli.idle_timeout {
        Some(timeout) => Options::default().with_idle_timeout(timeout),
        None => Options::default(),
    };
    let server = WebSocketServer::with_options(factory, options);

    let acceptor = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => Some(
            tls::load_acceptor(cert, key)
                .with_context(|| format!("loading {} and {}", cert.display(), key.display()))?,
        ),
        _ => None,
    };

    let listener = TcpListener::bind((cli.bind, cli.port))
        .await
        .with_context(|| format!("binding {}:{}", cli.bind, cli.port))?;

    let config = HttpConfig {
        resources: cli.resources,
        max_concurrent_requests: cli.max_requests,
        ..HttpConfig::default()
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("unable to listen for ctrl-c: {}", err);
                return;
            }
            log::info!("shutting down");
            shutdown.cancel();
        }
    });

    http::serve(listener, acceptor, server.clone(), config, shutdown).await?;
    server.shutdown_all().await;

    Ok(())
}
