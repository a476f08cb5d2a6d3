use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    handshake, CloseCode, Connection, ConnectionId, HandlerFactory, HandshakeError, IdGenerator,
    Options, Registry, Result,
};

/// Accepts WebSocket upgrades and runs one [`Connection`] per upgraded socket.
///
/// The server owns the [`Registry`], the [`HandlerFactory`] and the [`IdGenerator`]. Clones
/// share all three, so a clone can be handed to every HTTP connection task.
pub struct WebSocketServer<F> {
    inner: Arc<Inner<F>>,
}

struct Inner<F> {
    registry: Registry,
    factory: F,
    ids: IdGenerator,
    options: Options,
}

impl<F> Clone for WebSocketServer<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: HandlerFactory> WebSocketServer<F> {
    pub fn new(factory: F) -> Self {
        Self::with_options(factory, Options::default())
    }

    pub fn with_options(factory: F, options: Options) -> Self {
        Self::with_id_generator(factory, options, IdGenerator::new())
    }

    /// Creates a server that draws connection ids from `ids`.
    pub fn with_id_generator(factory: F, options: Options, ids: IdGenerator) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                factory,
                ids,
                options,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Answers a hyper upgrade request.
    ///
    /// Validates the request and returns the `101 Switching Protocols` response. Once hyper has
    /// sent it and handed over the socket, the connection is registered under `id` (or a fresh
    /// id) and its read loop starts. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// The [`HandshakeError`] of the first failed header check; nothing is spawned in that case.
    pub fn upgrade<B>(
        &self,
        request: &mut Request<B>,
        id: Option<ConnectionId>,
    ) -> std::result::Result<Response<Empty<Bytes>>, HandshakeError> {
        let accept = handshake::validate(request.headers())?;
        let on_upgrade = hyper::upgrade::on(request);

        let server = self.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    server.attach(TokioIo::new(upgraded), id).await;
                }
                Err(err) => log::warn!("upgrade failed: {}", err),
            }
        });

        Ok(handshake::response(&accept))
    }

    /// Completes the handshake on a raw stream whose request head the caller already parsed.
    ///
    /// Writes the `101` response to `stream` and attaches the connection.
    pub async fn accept<S>(
        &self,
        mut stream: S,
        headers: &HeaderMap,
        id: Option<ConnectionId>,
    ) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let accept = handshake::validate(headers)?;
        stream.write_all(&handshake::raw_response(&accept)).await?;
        stream.flush().await?;

        Ok(self.attach(stream, id).await)
    }

    /// Closes every live connection with [`CloseCode::Away`].
    pub async fn shutdown_all(&self) {
        self.inner.registry.shutdown_all().await;
    }

    /// Registers the stream as a connection and starts its read loop. A live connection already
    /// holding `id` is sent a close frame before its entry is replaced.
    async fn attach<S>(&self, stream: S, id: Option<ConnectionId>) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let registry = &self.inner.registry;
        let id = id.unwrap_or_else(|| self.fresh_id());
        let (reader, writer) = tokio::io::split(stream);

        let conn = Arc::new(Connection::new(id, writer, registry.clone()));
        let handler = self.inner.factory.build(id);

        if let Some(prev) = registry.get(id) {
            log::info!("{}: replacing previous connection", id);
            displace(&prev).await;
        }
        // Another attach may have registered the same id meanwhile. Closing is idempotent.
        if let Some(prev) = registry.register(Arc::clone(&conn)) {
            displace(&prev).await;
        }
        log::info!("{}: connected ({} live)", id, registry.len());

        let options = self.inner.options.clone();
        tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.run(reader, handler, options).await }
        });

        conn
    }

    fn fresh_id(&self) -> ConnectionId {
        loop {
            let id = self.inner.ids.next_id();
            if !self.inner.registry.contains(id) {
                return id;
            }
        }
    }
}

async fn displace(prev: &Connection) {
    if let Err(err) = prev.send_close(CloseCode::Normal, "replaced").await {
        log::debug!("{}: close of replaced connection failed: {}", prev.id(), err);
    }
}

impl<F> std::fmt::Debug for WebSocketServer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("registry", &self.inner.registry)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{Decoder, Role},
        test_util::client_bytes,
        Frame, Handler, OpCode, WebSocketError,
    };
    use futures::StreamExt;
    use hyper::header::{self, HeaderValue};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::FramedRead;

    struct Echo;

    impl Handler for Echo {
        async fn on_text(&mut self, conn: &Connection, text: String) -> Result<()> {
            conn.send_text(format!("{}: {}", conn.id(), text)).await
        }
    }

    fn echo(_: ConnectionId) -> Echo {
        Echo
    }

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    struct Client {
        frames: FramedRead<ReadHalf<DuplexStream>, Decoder>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, frame: Frame) {
            self.writer.write_all(&client_bytes([frame])).await.unwrap();
        }

        async fn next(&mut self) -> Option<Frame> {
            self.frames.next().await.map(|frame| frame.unwrap())
        }
    }

    async fn connect<F: HandlerFactory>(
        server: &WebSocketServer<F>,
        id: Option<ConnectionId>,
    ) -> (Arc<Connection>, Client) {
        let (client, stream) = tokio::io::duplex(64 * 1024);
        let conn = server
            .accept(stream, &upgrade_headers(), id)
            .await
            .unwrap();

        let (mut reader, writer) = tokio::io::split(client);
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(reader.read_u8().await.unwrap());
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        let client = Client {
            frames: FramedRead::new(reader, Decoder::new(Role::Client)),
            writer,
        };
        (conn, client)
    }

    #[tokio::test]
    async fn test_accept_runs_handler() {
        let server = WebSocketServer::new(echo);
        let (conn, mut client) = connect(&server, None).await;
        assert!(server.registry().contains(conn.id()));

        client.send(Frame::text("ping")).await;
        let reply = client.next().await.unwrap();
        assert_eq!(reply.opcode, OpCode::Text);
        assert_eq!(reply.payload, format!("{}: ping", conn.id()));
    }

    #[tokio::test]
    async fn test_rejected_handshake_writes_nothing() {
        let server = WebSocketServer::new(echo);
        let (mut client, stream) = tokio::io::duplex(1024);

        let mut headers = upgrade_headers();
        headers.remove(header::SEC_WEBSOCKET_KEY);

        let err = server.accept(stream, &headers, None).await.unwrap_err();
        assert!(matches!(
            err,
            WebSocketError::Handshake(HandshakeError::MissingSecWebSocketKey)
        ));
        assert!(server.registry().is_empty());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_ids_come_from_the_generator() {
        let server = WebSocketServer::with_id_generator(
            echo,
            Options::default(),
            IdGenerator::seeded(42),
        );
        let (conn, _client) = connect(&server, None).await;

        assert_eq!(conn.id(), IdGenerator::seeded(42).next_id());
    }

    #[tokio::test]
    async fn test_same_id_replaces_previous_connection() {
        let server = WebSocketServer::new(echo);
        let id = ConnectionId::from_u128(7);

        let (first, mut first_client) = connect(&server, Some(id)).await;
        let (second, mut second_client) = connect(&server, Some(id)).await;

        let close = first_client.next().await.unwrap();
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(close.close_code(), Some(CloseCode::Normal));

        // The replaced peer completes the closing handshake; its cleanup keeps the new entry.
        first_client.send(Frame::close(CloseCode::Normal, "")).await;
        assert!(first_client.next().await.is_none());
        assert_eq!(first.state(), crate::State::Closed);

        assert_eq!(server.registry().len(), 1);
        assert!(Arc::ptr_eq(&server.registry().get(id).unwrap(), &second));

        second_client.send(Frame::text("still here")).await;
        assert_eq!(
            second_client.next().await.unwrap().payload,
            format!("{id}: still here")
        );
    }

    #[tokio::test]
    async fn test_replaced_connection_is_closed_before_its_entry_is_overwritten() {
        let server = WebSocketServer::new(echo);
        let id = ConnectionId::from_u128(8);
        let (first, mut first_client) = connect(&server, Some(id)).await;

        let (_client, stream) = tokio::io::duplex(64 * 1024);
        let second = server
            .accept(stream, &upgrade_headers(), Some(id))
            .await
            .unwrap();

        // No yield since accept returned: the close was sent as part of the replacement.
        assert_eq!(first.state(), crate::State::Closing);
        assert!(Arc::ptr_eq(&server.registry().get(id).unwrap(), &second));

        let close = first_client.next().await.unwrap();
        assert_eq!(close.close_code(), Some(CloseCode::Normal));
        assert_eq!(&close.payload[2..], b"replaced");
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_with_1001() {
        let server = WebSocketServer::new(echo);
        let (_, mut a) = connect(&server, None).await;
        let (_, mut b) = connect(&server, None).await;

        server.shutdown_all().await;

        for client in [&mut a, &mut b] {
            let close = client.next().await.unwrap();
            assert_eq!(close.close_code(), Some(CloseCode::Away));
            assert!(client.next().await.is_none());
        }
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_peer_disconnect_unregisters() {
        let server = WebSocketServer::new(echo);
        let (conn, client) = connect(&server, None).await;

        drop(client);
        while conn.state() != crate::State::Closed {
            tokio::task::yield_now().await;
        }
        assert!(server.registry().is_empty());
    }
}
