use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::{
    codec::{Encoder as _, FramedRead},
    sync::CancellationToken,
};

use crate::{
    close::CloseCode,
    codec::{Decoder, Encoder, Role},
    frame::{Frame, Message, OpCode, MAX_CONTROL_PAYLOAD_LEN, MAX_PAYLOAD_LEN},
    ConnectionId, Handler, Options, Registry, Result, WebSocketError,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a [`Connection`]. It only moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Frames flow in both directions.
    Open = 0,
    /// A close frame was sent or received; the read loop is winding down.
    Closing = 1,
    /// The stream is released and the connection is gone from the registry.
    Closed = 2,
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            0 => State::Open,
            1 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Serialized frames waiting to be written, and whether some sender is writing them.
#[derive(Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    draining: bool,
    /// A frame was left half-written. Nothing may be written after it.
    broken: bool,
}

/// Hands the queue back when a drainer stops early.
///
/// A drainer dropped between frames only resets `draining`, so the next sender takes over.
/// One dropped in the middle of a frame leaves the stream unparseable: the connection is marked
/// broken and its read loop is stopped so it tears down.
struct DrainGuard<'a> {
    outbound: &'a Mutex<Outbound>,
    cancel: &'a CancellationToken,
    armed: bool,
    writing: bool,
}

impl DrainGuard<'_> {
    fn disarm(&mut self, outbound: &mut Outbound) {
        outbound.draining = false;
        self.armed = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut outbound = lock(self.outbound);
        outbound.draining = false;
        if self.writing {
            outbound.broken = true;
            outbound.queue.clear();
            drop(outbound);
            self.cancel.cancel();
        }
    }
}

fn lock(outbound: &Mutex<Outbound>) -> MutexGuard<'_, Outbound> {
    outbound.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An upgraded WebSocket connection.
///
/// The read half is owned by the connection's read loop, which runs in its own task and feeds
/// the [`Handler`]. The write half sits behind an outbound queue that any task may push to:
/// each send serializes its frames, appends them to the queue in one step and, if no other
/// sender is currently writing, drains the queue itself. Frames of concurrent senders are
/// therefore never interleaved on the wire, and no background writer task is needed.
///
/// A connection is shared as `Arc<Connection>` between its read loop and the [`Registry`].
pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    close_sent: AtomicBool,
    outbound: Mutex<Outbound>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    registry: Registry,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new<W>(id: ConnectionId, writer: W, registry: Registry) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            state: AtomicU8::new(State::Open as u8),
            close_sent: AtomicBool::new(false),
            outbound: Mutex::new(Outbound::default()),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            registry,
            cancel: CancellationToken::new(),
        }
    }

    /// The identifier this connection is registered under.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// The registry of the server that accepted this connection.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Sends a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into())).await
    }

    /// Sends a message, split into a fragment run when it does not fit one frame.
    ///
    /// The fragments are queued together, so no other frame can end up between them.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] once the connection is closed, or the I/O error hit
    /// while this call was writing the queue.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        let opcode = message.opcode();
        self.enqueue(fragment(opcode, message.into_payload())).await
    }

    /// Sends a single frame as is.
    ///
    /// # Errors
    /// [`WebSocketError::ControlFrameTooLarge`] for a control frame above 125 bytes,
    /// [`WebSocketError::FrameTooLarge`] for any frame above 65535 bytes.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.enqueue([frame]).await
    }

    /// Sends a ping. The peer answers with a pong carrying the same payload.
    pub async fn send_ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::ping(payload)).await
    }

    /// Sends a close frame and moves the connection to [`State::Closing`].
    ///
    /// Only the first close frame is sent; later calls return `Ok(())` without writing. The
    /// read loop keeps running until the peer answers or disconnects.
    pub async fn send_close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if 2 + reason.len() > MAX_CONTROL_PAYLOAD_LEN {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.state.compare_exchange(
            State::Open as u8,
            State::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.enqueue([Frame::close(code, reason)]).await
    }

    /// Asks the read loop to stop. It exits at its next wake-up and closes the connection with
    /// [`CloseCode::Normal`] if no close frame was sent yet.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Closes the connection: sends a close frame with `code` unless one was already sent,
    /// stops the read loop, unregisters the connection and releases the stream.
    ///
    /// Safe to call any number of times from any task; only the first call has an effect.
    pub async fn close(&self, code: CloseCode) {
        if self.state() == State::Closed {
            return;
        }
        if let Err(err) = self.send_close(code, "").await {
            log::debug!("{}: close frame not delivered: {}", self.id, err);
        }
        self.finish().await;
    }

    /// The one-time teardown. Returns `false` if the connection was already closed.
    async fn finish(&self) -> bool {
        if State::from(self.state.swap(State::Closed as u8, Ordering::AcqRel)) == State::Closed {
            return false;
        }

        self.cancel.cancel();
        self.registry.unregister(self.id, self);

        let mut slot = self.writer.lock().await;
        if let Some(mut writer) = slot.take() {
            // Frames queued before the state flipped are still owed to the peer, unless a
            // partial frame already made the stream unusable.
            let pending: Vec<Bytes> = {
                let mut outbound = lock(&self.outbound);
                if outbound.broken {
                    log::debug!("{}: stream broken mid-frame", self.id);
                    outbound.queue.clear();
                }
                outbound.queue.drain(..).collect()
            };
            for bytes in pending {
                if let Err(err) = write_bytes(&mut writer, &bytes).await {
                    log::debug!("{}: dropping queued frames: {}", self.id, err);
                    break;
                }
            }
            if let Err(err) = writer.shutdown().await {
                log::debug!("{}: shutdown failed: {}", self.id, err);
            }
        }

        log::info!("{}: closed", self.id);
        true
    }

    async fn enqueue(&self, frames: impl IntoIterator<Item = Frame>) -> Result<()> {
        let mut encoder = Encoder::new(Role::Server);
        let mut buf = BytesMut::new();
        let mut encoded = Vec::new();
        for frame in frames {
            if frame.opcode.is_control() && frame.payload.len() > MAX_CONTROL_PAYLOAD_LEN {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
            encoder.encode(frame, &mut buf)?;
            encoded.push(buf.split().freeze());
        }

        {
            let mut outbound = lock(&self.outbound);
            if outbound.broken || self.state() == State::Closed {
                return Err(WebSocketError::ConnectionClosed);
            }
            outbound.queue.extend(encoded);
            if outbound.draining {
                return Ok(());
            }
            outbound.draining = true;
        }

        self.drain().await
    }

    /// Writes queued frames until the queue is empty. Only one task drains at a time.
    async fn drain(&self) -> Result<()> {
        let mut guard = DrainGuard {
            outbound: &self.outbound,
            cancel: &self.cancel,
            armed: true,
            writing: false,
        };

        loop {
            let mut writer = self.writer.lock().await;
            let next = {
                let mut outbound = lock(&self.outbound);
                if outbound.broken {
                    outbound.queue.clear();
                    guard.disarm(&mut outbound);
                    return Err(WebSocketError::ConnectionClosed);
                }
                match outbound.queue.pop_front() {
                    Some(bytes) => bytes,
                    None => {
                        guard.disarm(&mut outbound);
                        return Ok(());
                    }
                }
            };

            guard.writing = true;
            let res = match writer.as_mut() {
                Some(writer) => write_bytes(writer, &next).await,
                None => Err(WebSocketError::ConnectionClosed),
            };
            guard.writing = false;

            if let Err(err) = res {
                let mut outbound = lock(&self.outbound);
                outbound.queue.clear();
                guard.disarm(&mut outbound);
                return Err(err);
            }
        }
    }

    /// The read loop. Returns once the connection is closed.
    pub(crate) async fn run<R, H>(&self, reader: R, mut handler: H, options: Options)
    where
        R: AsyncRead + Unpin + Send,
        H: Handler,
    {
        let mut frames = FramedRead::new(reader, Decoder::new(Role::Server));
        let mut message = Reassembly::new(options.max_message_size);

        let outcome = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                next = next_frame(&mut frames, options.idle_timeout) => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(err) => break Err(Exit::Peer(err)),
            };

            if let Err(err) = self.on_frame(&mut handler, &mut message, frame).await {
                break Err(err);
            }
            if self.state() != State::Open {
                break Ok(());
            }
        };

        let code = match outcome {
            Ok(()) => CloseCode::Normal,
            Err(Exit::Peer(err)) if err.is_protocol_violation() => {
                log::warn!("{}: protocol error: {}", self.id, err);
                err.close_code()
            }
            Err(Exit::Peer(err)) => {
                log::debug!("{}: stream error: {}", self.id, err);
                err.close_code()
            }
            Err(Exit::Handler(err)) => {
                log::error!("{}: handler failed: {}", self.id, err);
                CloseCode::Error
            }
        };

        self.close(code).await;
    }

    async fn on_frame<H: Handler>(
        &self,
        handler: &mut H,
        message: &mut Reassembly,
        frame: Frame,
    ) -> std::result::Result<(), Exit> {
        match frame.opcode {
            OpCode::Close => {
                let code = frame.close_code();
                handler
                    .on_close(self, code, frame.payload.clone())
                    .await
                    .map_err(Exit::Handler)?;

                let reply = match code {
                    Some(code) if code.is_allowed() => code,
                    None if frame.payload.is_empty() => CloseCode::Normal,
                    _ => CloseCode::Protocol,
                };
                self.send_close(reply, "").await.map_err(Exit::Peer)
            }
            OpCode::Ping => {
                handler.on_ping(self).await.map_err(Exit::Handler)?;
                self.send_frame(Frame::pong(frame.payload))
                    .await
                    .map_err(Exit::Peer)
            }
            OpCode::Pong => handler.on_pong(self).await.map_err(Exit::Handler),
            _ => match message.push(frame).map_err(Exit::Peer)? {
                Some(Message::Text(text)) => {
                    handler.on_text(self, text).await.map_err(Exit::Handler)
                }
                Some(Message::Binary(data)) => {
                    handler.on_binary(self, data).await.map_err(Exit::Handler)
                }
                None => Ok(()),
            },
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Why the read loop ended early.
enum Exit {
    Peer(WebSocketError),
    Handler(WebSocketError),
}

async fn next_frame<R: AsyncRead + Unpin>(
    frames: &mut FramedRead<R, Decoder>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Frame>> {
    let next = match idle_timeout {
        Some(timeout) => tokio::time::timeout(timeout, frames.next())
            .await
            .map_err(|_| WebSocketError::IdleTimeout)?,
        None => frames.next().await,
    };
    next.transpose()
}

async fn write_bytes(writer: &mut BoxedWriter, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Splits a payload into frames of at most [`MAX_PAYLOAD_LEN`] bytes.
fn fragment(opcode: OpCode, payload: Bytes) -> Vec<Frame> {
    let len = payload.len();
    if len <= MAX_PAYLOAD_LEN {
        return vec![Frame::new(true, opcode, payload)];
    }

    (0..len.div_ceil(MAX_PAYLOAD_LEN))
        .map(|i| {
            let start = i * MAX_PAYLOAD_LEN;
            let end = (start + MAX_PAYLOAD_LEN).min(len);
            let opcode = if i == 0 { opcode } else { OpCode::Continuation };
            Frame::new(end == len, opcode, payload.slice(start..end))
        })
        .collect()
}

/// Accumulates the fragments of one data message.
struct Reassembly {
    opcode: Option<OpCode>,
    fragments: Vec<Bytes>,
    size: usize,
    max_size: usize,
}

impl Reassembly {
    fn new(max_size: usize) -> Self {
        Self {
            opcode: None,
            fragments: Vec::new(),
            size: 0,
            max_size,
        }
    }

    fn reset(&mut self) {
        self.opcode = None;
        self.fragments.clear();
        self.size = 0;
    }

    /// Adds a data frame. Returns the message once its final fragment arrived.
    fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = match (frame.opcode, self.opcode) {
            (OpCode::Continuation, Some(opcode)) => opcode,
            (OpCode::Continuation, None) => return Err(WebSocketError::InvalidContinuationFrame),
            (_, Some(_)) => {
                self.reset();
                return Err(WebSocketError::InvalidFragment);
            }
            (opcode, None) => opcode,
        };

        let size = self.size + frame.payload.len();
        if size > self.max_size {
            self.reset();
            return Err(WebSocketError::MessageTooLarge);
        }

        if !frame.fin {
            self.opcode = Some(opcode);
            self.size = size;
            self.fragments.push(frame.payload);
            return Ok(None);
        }

        let payload = if self.fragments.is_empty() {
            frame.payload
        } else {
            let mut buf = BytesMut::with_capacity(size);
            for fragment in self.fragments.drain(..) {
                buf.extend_from_slice(&fragment);
            }
            buf.extend_from_slice(&frame.payload);
            buf.freeze()
        };
        self.reset();

        match opcode {
            OpCode::Text => decode_text(&payload).map(|text| Some(Message::Text(text))),
            _ => Ok(Some(Message::Binary(payload))),
        }
    }
}

fn decode_text(payload: &[u8]) -> Result<String> {
    #[cfg(feature = "simd")]
    let text = simdutf8::basic::from_utf8(payload).map_err(|_| WebSocketError::InvalidUTF8)?;
    #[cfg(not(feature = "simd"))]
    let text = std::str::from_utf8(payload).map_err(|_| WebSocketError::InvalidUTF8)?;
    Ok(text.to_owned())
}
