//! A minimal HTTP/1.1 front end.
//!
//! Every accepted socket carries exactly one request (keep-alive is off). `GET` on the upgrade
//! path hands the socket to the [`WebSocketServer`]; `GET /` serves the index page; any other
//! `GET` serves a file from the resources directory. The number of sockets being served at once
//! is capped by [`HttpConfig::max_concurrent_requests`]; an upgraded socket no longer counts.

use std::{
    convert::Infallible,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::Semaphore,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{HandlerFactory, HandshakeError, Result, WebSocketServer};

/// Where the front end finds its files and how much it serves at once.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Directory static files are served from.
    ///
    /// Default: `./resources`
    pub resources: PathBuf,
    /// File under `resources` answered for `/`.
    ///
    /// Default: `index.html`
    pub index: String,
    /// Path that triggers the WebSocket upgrade.
    ///
    /// Default: `/upgrade`
    pub upgrade_path: String,
    /// Sockets served concurrently before `accept` pauses.
    ///
    /// Default: 20
    pub max_concurrent_requests: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            resources: PathBuf::from("./resources"),
            index: String::from("index.html"),
            upgrade_path: String::from("/upgrade"),
            max_concurrent_requests: 20,
        }
    }
}

/// A request the front end refuses, with the status it is answered with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {reason}")]
pub struct HttpError {
    status: StatusCode,
    reason: String,
}

impl HttpError {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        respond(self.status, "text/plain", Bytes::from(self.reason))
    }
}

impl From<HandshakeError> for HttpError {
    fn from(err: HandshakeError) -> Self {
        Self::new(err.status(), err.reason())
    }
}

/// Accepts connections on `listener` until `shutdown` is cancelled.
///
/// With `tls`, every socket goes through the TLS handshake first. Connections already upgraded
/// keep running after this returns; close them with [`WebSocketServer::shutdown_all`].
pub async fn serve<F: HandlerFactory>(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    server: WebSocketServer<F>,
    config: HttpConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
    let config = Arc::new(config);

    log::info!(
        "listening on {}{}",
        listener.local_addr()?,
        if tls.is_some() { " (TLS)" } else { "" }
    );

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    continue;
                }
            },
        };
        log::debug!("{}: accepted", peer);

        let tls = tls.clone();
        let server = server.clone();
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let _permit = permit;
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, peer, server, config).await,
                    Err(err) => log::debug!("{}: TLS handshake failed: {}", peer, err),
                },
                None => serve_connection(stream, peer, server, config).await,
            }
        });
    }

    log::info!("accept loop stopped");
    Ok(())
}

async fn serve_connection<S, F>(
    stream: S,
    peer: SocketAddr,
    server: WebSocketServer<F>,
    config: Arc<HttpConfig>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: HandlerFactory,
{
    let service = service_fn(move |request| {
        let server = server.clone();
        let config = Arc::clone(&config);
        async move { Ok::<_, Infallible>(route(request, &server, &config).await) }
    });

    let conn = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();

    if let Err(err) = conn.await {
        log::debug!("{}: {}", peer, err);
    }
}

/// Answers one request.
pub async fn route<B, F: HandlerFactory>(
    mut request: Request<B>,
    server: &WebSocketServer<F>,
    config: &HttpConfig,
) -> Response<Full<Bytes>> {
    log::debug!("{} {}", request.method(), request.uri().path());

    match handle(&mut request, server, config).await {
        Ok(response) => response,
        Err(err) => {
            log::debug!("{} refused: {}", request.uri().path(), err);
            err.into_response()
        }
    }
}

async fn handle<B, F: HandlerFactory>(
    request: &mut Request<B>,
    server: &WebSocketServer<F>,
    config: &HttpConfig,
) -> std::result::Result<Response<Full<Bytes>>, HttpError> {
    if request.method() != Method::GET {
        return Err(HttpError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }

    let path = request.uri().path().to_owned();
    if path == config.upgrade_path {
        let response = server.upgrade(request, None)?;
        return Ok(response.map(|_| Full::new(Bytes::new())));
    }

    let file = match path.as_str() {
        "/" => config.index.as_str(),
        path => path.strip_prefix('/').unwrap_or(path),
    };
    let file = config.resources.join(relative_path(file)?);

    let not_found = || HttpError::new(StatusCode::NOT_FOUND, "not found");
    let metadata = tokio::fs::metadata(&file).await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }
    let body = tokio::fs::read(&file).await.map_err(|_| not_found())?;

    Ok(respond(StatusCode::OK, content_type(&file), Bytes::from(body)))
}

/// Accepts only plain relative paths: no `..`, no root, no prefix.
fn relative_path(path: &str) -> std::result::Result<&Path, HttpError> {
    let path = Path::new(path);
    if path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
    {
        Ok(path)
    } else {
        Err(HttpError::new(StatusCode::BAD_REQUEST, "invalid path"))
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        _ => "text/plain",
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
