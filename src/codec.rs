//! Frame codec: turns bytes into [`Frame`]s and back.
//!
//! [`Decoder`] and [`Encoder`] implement the `tokio_util` codec traits so they plug into
//! [`FramedRead`](tokio_util::codec::FramedRead) and friends. The [`Role`] decides which side
//! of the masking rule applies: client frames must be masked, server frames must not be.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD_LEN, MAX_HEAD_SIZE},
    mask::apply_mask,
    WebSocketError,
};

/// Which end of the connection a codec runs on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accepts masked frames only and writes unmasked frames.
    Server,
    /// Accepts unmasked frames only and masks every frame it writes.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The two fixed bytes are parsed; waiting for the extended length and mask.
    Header(Header),
    /// Waiting for the payload.
    Payload(HeaderAndMask),
}

/// The fields carried by the two fixed header bytes.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// The 7-bit length field.
    length_code: u8,
    /// Bytes of extended length following the fixed header (0 or 2).
    extra: usize,
    /// Extended length plus mask.
    header_size: usize,
}

/// Everything needed to read the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A decoder for WebSocket frames.
///
/// Parsing is staged (fixed header, extended length and mask, payload) so a frame split across
/// several reads is resumed where it stopped. Payloads are unmasked before the frame is
/// returned.
pub struct Decoder {
    role: Role,
    state: Option<ReadState>,
}

impl Decoder {
    pub fn new(role: Role) -> Self {
        Self { role, state: None }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` once a whole frame is buffered.
    /// - `Ok(None)` when more bytes are needed.
    /// - `Err(WebSocketError)` on a protocol violation. Violations detectable from the two fixed
    ///   bytes (including a 64-bit length) are reported before anything past them is read.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    if length_code == 127 {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    match (self.role, masked) {
                        (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
                        (Role::Client, true) => return Err(WebSocketError::MaskedFrame),
                        _ => {}
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if usize::from(length_code) > MAX_CONTROL_PAYLOAD_LEN {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    let extra = if length_code == 126 { 2 } else { 0 };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        2 => usize::from(src.get_u16()),
                        _ => usize::from(header.length_code),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    let payload_len = header_and_mask.payload_len;
                    if src.remaining() < payload_len {
                        src.reserve(payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let mask = header_and_mask.mask;

                    let mut payload = src.split_to(payload_len);
                    if let Some(mask) = mask {
                        apply_mask(&mut payload, mask);
                    }

                    let mut frame = Frame::new(header.fin, header.opcode, payload.freeze());
                    frame.set_mask(mask);

                    break Ok(Some(frame));
                }
            }
        }
    }

    /// Like `decode`, but a stream ending inside a frame is an error even when the bytes read
    /// so far have all been consumed.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.state.is_none() => Ok(None),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended in the middle of a frame",
            )
            .into()),
        }
    }
}

/// WebSocket frame encoder.
///
/// On the server side frames are written unmasked. On the client side every frame is masked,
/// with the frame's own key if it has one and a random key otherwise.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    /// Writes the header and payload of `frame` to `dst`.
    ///
    /// # Errors
    /// [`WebSocketError::FrameTooLarge`] if the payload exceeds 65535 bytes; `dst` is left
    /// untouched in that case.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask = match self.role {
            Role::Server => None,
            Role::Client => Some(frame.mask_key().unwrap_or_else(rand::random)),
        };

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..], mask)?;

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = mask {
            apply_mask(&mut dst[start..], mask);
        }

        Ok(())
    }
}

/// A decoder and encoder pair, for use with [`Framed`](tokio_util::codec::Framed).
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    pub fn new(role: Role) -> Self {
        Self::from((Decoder::new(role), Encoder::new(role)))
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }

    #[inline]
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode_eof(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}
