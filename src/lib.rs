//! # wsrelay
//! A WebSocket (RFC 6455) connection server with a connection registry for addressed and broadcast
//! delivery, and a pluggable per-connection [`Handler`] used to build application protocols such
//! as a WebRTC signaling relay.
//!
//! The crate is split along the path a socket takes:
//!
//! - [`http`]: a minimal HTTP/1.1 front end (routing, static files, upgrade trigger).
//! - [`handshake`]: header validation and `Sec-WebSocket-Accept` computation.
//! - [`codec`] and [`frame`]: frame parsing and serialization, masking, length encoding.
//! - [`Connection`]: the per-socket state machine, fragment reassembly and the outbound queue.
//! - [`Registry`]: the id to connection table behind `send_to`, `broadcast` and `broadcast_except`.
//! - [`app`]: the handlers shipped with the crate.
//!
//! # Limits
//! - Frames use at most the 16-bit extended length. A frame announcing a 64-bit length is
//!   rejected with [`WebSocketError::FrameTooLarge`].
//! - Outbound messages larger than one frame are sent as a fragment run.
//! - No extensions are negotiated, so reserved bits must be zero.
//!
//! # Server Example
//! ```no_run
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//! use wsrelay::{app::SignalingRelay, http::HttpConfig, Options, WebSocketServer};
//!
//! #[tokio::main]
//! async fn main() -> wsrelay::Result<()> {
//!     let server = WebSocketServer::with_options(SignalingRelay::new, Options::default());
//!     let listener = TcpListener::bind("0.0.0.0:8080").await?;
//!
//!     let shutdown = CancellationToken::new();
//!     let config = HttpConfig::default();
//!     wsrelay::http::serve(listener, None, server.clone(), config, shutdown).await?;
//!
//!     server.shutdown_all().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod app;
pub mod close;
pub mod codec;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod tls;

mod connection;
mod handler;
mod id;
mod mask;
mod options;
mod registry;
mod server;

#[cfg(test)]
mod test_util;

use thiserror::Error;

pub use close::CloseCode;
pub use connection::{Connection, State};
pub use frame::{Frame, Message, OpCode};
pub use handler::{Handler, HandlerFactory};
pub use handshake::HandshakeError;
pub use id::{ConnectionId, IdGenerator};
pub use options::Options;
pub use registry::Registry;
pub use server::WebSocketServer;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall in two groups that are logged differently but cleaned up the same way
/// (the connection is closed and unregistered):
///
/// - Protocol violations: the peer sent something RFC 6455 forbids. See
///   [`WebSocketError::is_protocol_violation`].
/// - Stream errors: the transport failed or went silent.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A data frame started a new message while a fragmented message was still in progress.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A text message is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// The frame announced a 64-bit extended length, or an outbound payload does not fit the
    /// 16-bit extended length.
    #[error("Frame too large")]
    FrameTooLarge,

    /// The reassembled message exceeds [`Options::max_message_size`].
    #[error("Message too large")]
    MessageTooLarge,

    /// A client frame arrived without the mask bit set.
    #[error("Client frames must be masked")]
    UnmaskedFrame,

    /// A server frame arrived with the mask bit set.
    #[error("Server frames must not be masked")]
    MaskedFrame,

    /// Reserved bits are set although no extension was negotiated.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A close, ping or pong frame without the FIN bit.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame with more than 125 bytes of payload.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// The opcode is one of the reserved values (0x3-0x7, 0xB-0xF).
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// The connection is closed; nothing can be sent anymore.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The peer sent nothing for longer than [`Options::idle_timeout`].
    #[error("Connection idle for too long")]
    IdleTimeout,

    /// The upgrade request was rejected.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Underlying I/O failure, including the peer disconnecting mid-frame.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Errors from the hyper HTTP server.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// TLS configuration errors.
    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),
}

impl WebSocketError {
    /// Whether the error is a deliberate protocol violation by the peer, as opposed to a
    /// transport failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WebSocketError::InvalidFragment
                | WebSocketError::InvalidContinuationFrame
                | WebSocketError::InvalidUTF8
                | WebSocketError::FrameTooLarge
                | WebSocketError::MessageTooLarge
                | WebSocketError::UnmaskedFrame
                | WebSocketError::MaskedFrame
                | WebSocketError::ReservedBitsNotZero
                | WebSocketError::ControlFrameFragmented
                | WebSocketError::ControlFrameTooLarge
                | WebSocketError::InvalidOpCode(_)
        )
    }

    /// The close code sent to the peer when a connection ends because of this error.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::FrameTooLarge | WebSocketError::MessageTooLarge => CloseCode::Size,
            WebSocketError::InvalidUTF8 => CloseCode::Invalid,
            WebSocketError::InvalidFragment
            | WebSocketError::InvalidContinuationFrame
            | WebSocketError::UnmaskedFrame
            | WebSocketError::MaskedFrame
            | WebSocketError::ReservedBitsNotZero
            | WebSocketError::ControlFrameFragmented
            | WebSocketError::ControlFrameTooLarge
            | WebSocketError::InvalidOpCode(_) => CloseCode::Protocol,
            WebSocketError::IdleTimeout => CloseCode::Away,
            WebSocketError::IoError(_) | WebSocketError::ConnectionClosed => CloseCode::Normal,
            _ => CloseCode::Error,
        }
    }
}
