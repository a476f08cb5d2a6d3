//! Helpers shared by the unit tests.

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    codec::{Decoder, Encoder, Role},
    CloseCode, Connection, Frame, Handler, OpCode, Result,
};

#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    shutdowns: usize,
    stall: bool,
}

/// An `AsyncWrite` that records everything written to it.
///
/// Every other write returns `Pending` and at most 7 bytes are accepted per call, so a frame is
/// always written in several steps with yields in between.
#[derive(Clone, Default)]
pub(crate) struct CaptureWriter {
    inner: Arc<Mutex<Capture>>,
}

impl CaptureWriter {
    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().bytes.clone()
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.inner.lock().unwrap().shutdowns
    }

    /// Parses everything written so far as server frames. Panics on trailing partial frames.
    pub(crate) fn frames(&self) -> Vec<Frame> {
        parse_server_frames(&self.bytes())
    }
}

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut capture = self.inner.lock().unwrap();
        capture.stall = !capture.stall;
        if capture.stall {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let n = buf.len().min(7);
        capture.bytes.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.lock().unwrap().shutdowns += 1;
        Poll::Ready(Ok(()))
    }
}

/// An `AsyncWrite` that accepts `limit` bytes and then stays `Pending` forever.
#[derive(Clone)]
pub(crate) struct StallWriter {
    inner: Arc<Mutex<Capture>>,
    limit: usize,
}

impl StallWriter {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            inner: Arc::default(),
            limit,
        }
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().bytes.clone()
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.inner.lock().unwrap().shutdowns
    }
}

impl AsyncWrite for StallWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut capture = self.inner.lock().unwrap();
        let room = self.limit - capture.bytes.len();
        if room == 0 {
            return Poll::Pending;
        }

        let n = buf.len().min(room);
        capture.bytes.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.lock().unwrap().shutdowns += 1;
        Poll::Ready(Ok(()))
    }
}

/// Parses unmasked server-to-client frames.
pub(crate) fn parse_server_frames(bytes: &[u8]) -> Vec<Frame> {
    let mut buf = BytesMut::from(bytes);
    let mut decoder = Decoder::new(Role::Client);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.decode(&mut buf).expect("valid server frame") {
        frames.push(frame);
    }
    assert!(buf.is_empty(), "trailing bytes after last frame");
    frames
}

/// Serializes frames the way a client would put them on the wire.
pub(crate) fn client_bytes(frames: impl IntoIterator<Item = Frame>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    let mut encoder = Encoder::new(Role::Client);
    for frame in frames {
        encoder.encode(frame, &mut buf).expect("encodable frame");
    }
    buf.to_vec()
}

/// The close codes of every close frame in `frames`.
pub(crate) fn close_codes(frames: &[Frame]) -> Vec<Option<CloseCode>> {
    frames
        .iter()
        .filter(|frame| frame.opcode == OpCode::Close)
        .map(Frame::close_code)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseCode>),
    Ping,
    Pong,
}

/// A handler that records every callback.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Handler for Recorder {
    async fn on_text(&mut self, _conn: &Connection, text: String) -> Result<()> {
        self.push(Event::Text(text));
        Ok(())
    }

    async fn on_binary(&mut self, _conn: &Connection, data: Bytes) -> Result<()> {
        self.push(Event::Binary(data));
        Ok(())
    }

    async fn on_close(
        &mut self,
        _conn: &Connection,
        code: Option<CloseCode>,
        _payload: Bytes,
    ) -> Result<()> {
        self.push(Event::Close(code));
        Ok(())
    }

    async fn on_ping(&mut self, _conn: &Connection) -> Result<()> {
        self.push(Event::Ping);
        Ok(())
    }

    async fn on_pong(&mut self, _conn: &Connection) -> Result<()> {
        self.push(Event::Pong);
        Ok(())
    }
}
