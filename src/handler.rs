use std::future::Future;

use bytes::Bytes;

use crate::{close::CloseCode, Connection, ConnectionId, Result};

/// Application callbacks for one connection.
///
/// A handler is built per connection by a [`HandlerFactory`] and driven by that connection's
/// read loop, so calls on one handler never overlap. Handlers of different connections run
/// concurrently and reach each other through [`Connection::registry`].
///
/// Returning an error closes the connection with [`CloseCode::Error`].
///
/// # Example
/// ```rust
/// use wsrelay::{Connection, Handler, Result};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     async fn on_text(&mut self, conn: &Connection, text: String) -> Result<()> {
///         conn.send_text(text).await
///     }
/// }
/// ```
pub trait Handler: Send + 'static {
    /// A complete text message arrived.
    fn on_text(
        &mut self,
        conn: &Connection,
        text: String,
    ) -> impl Future<Output = Result<()>> + Send;

    /// A complete binary message arrived.
    fn on_binary(
        &mut self,
        _conn: &Connection,
        _data: Bytes,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// The peer sent a close frame. `code` is `None` when the payload carries no status code;
    /// `payload` is the raw close payload.
    ///
    /// The close response is sent after this returns.
    fn on_close(
        &mut self,
        _conn: &Connection,
        _code: Option<CloseCode>,
        _payload: Bytes,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// The peer sent a ping. The pong is sent after this returns.
    fn on_ping(&mut self, _conn: &Connection) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// The peer sent a pong.
    fn on_pong(&mut self, _conn: &Connection) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Builds the [`Handler`] of each upgraded connection.
///
/// Any `Fn(ConnectionId) -> H` closure or function is a factory.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler;

    fn build(&self, id: ConnectionId) -> Self::Handler;
}

impl<H, F> HandlerFactory for F
where
    H: Handler,
    F: Fn(ConnectionId) -> H + Send + Sync + 'static,
{
    type Handler = H;

    fn build(&self, id: ConnectionId) -> H {
        self(id)
    }
}
