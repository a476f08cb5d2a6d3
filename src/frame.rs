//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2),
//! and the [`Message`] type handed to handlers once fragments are reassembled.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16 bits)          |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |   Masking-key, if MASK set to 1                               |
//! +---------------------------------------------------------------+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Only the 16-bit extended length is supported: a payload length field of 127 is rejected,
//! which caps a single frame at [`MAX_PAYLOAD_LEN`] bytes.
use bytes::Bytes;

use crate::{close::CloseCode, WebSocketError};

/// Largest payload a single frame can carry with the 16-bit extended length.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Largest payload a close, ping or pong frame can carry.
pub const MAX_CONTROL_PAYLOAD_LEN: usize = 125;

/// Two fixed bytes, two bytes of extended length and four bytes of mask.
pub(crate) const MAX_HEAD_SIZE: usize = 8;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented, carry at most 125 bytes, and are handled as soon
    /// as they arrive, even in the middle of a fragmented message.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single WebSocket frame.
///
/// Frames produced by the [`Decoder`](crate::codec::Decoder) are already unmasked; the key
/// they carried is kept in [`Frame::mask_key`] for inspection. Frames built for sending have
/// no key unless one is attached with [`Frame::with_mask`], which only the client-side
/// [`Encoder`](crate::codec::Encoder) honours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Masking key the frame was received with, or should be sent with.
    mask: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new unmasked frame.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    /// A final continuation frame. Use [`Frame::with_fin`] for the middle of a run.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, payload)
    }

    /// A close frame carrying `code` followed by `reason`.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, code.payload(reason))
    }

    /// A close frame with an arbitrary payload.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Sets the FIN bit.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Attaches a masking key.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    pub(crate) fn set_mask(&mut self, mask: Option<[u8; 4]>) {
        self.mask = mask;
    }

    /// The masking key, if any.
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Whether the frame has a masking key.
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Extracts the close code from a close frame's payload.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_payload(&self.payload)
    }

    /// Formats the frame header into `head` and returns its size.
    ///
    /// `mask` is written after the length when present; the caller masks the payload.
    ///
    /// # Errors
    /// [`WebSocketError::FrameTooLarge`] when the payload does not fit the 16-bit extended length.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(
        &self,
        head: &mut [u8],
        mask: Option<[u8; 4]>,
    ) -> Result<usize, WebSocketError> {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len <= 125 {
            head[1] = len as u8;
            2
        } else if len <= MAX_PAYLOAD_LEN {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            return Err(WebSocketError::FrameTooLarge);
        };

        match mask {
            Some(mask) => {
                head[1] |= 0x80;
                head[size..size + 4].copy_from_slice(&mask);
                Ok(size + 4)
            }
            None => Ok(size),
        }
    }
}

/// A reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Binary(Bytes),
}

impl Message {
    /// The opcode of the first frame this message is sent with.
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    /// Returns the text if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    /// Consumes the message into its payload bytes.
    pub fn into_payload(self) -> Bytes {
        match self {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8_invalid() {
            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(byte)) if byte == code
                ));
            }
        }

        #[test]
        fn test_u8_conversions_agree() {
            for opcode in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(opcode)).unwrap(), opcode);
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_frame_payload() {
            let frame = Frame::close(CloseCode::Normal, "Normal closure");

            assert_eq!(frame.opcode, OpCode::Close);
            assert!(frame.fin);
            assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
            assert_eq!(&frame.payload[2..], b"Normal closure");
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        }

        #[test]
        fn test_fmt_head_short() {
            let frame = Frame::text("Header test");
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head, None).unwrap();

            assert_eq!(size, 2);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 11);
        }

        #[test]
        fn test_fmt_head_extended_and_masked() {
            let frame = Frame::binary(vec![0u8; 300]).with_fin(false);
            let mask = [0xAA, 0xBB, 0xCC, 0xDD];
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head, Some(mask)).unwrap();

            assert_eq!(size, 8);
            assert_eq!(head[0], 0x02);
            assert_eq!(head[1], 0x80 | 126);
            assert_eq!(&head[2..4], &300u16.to_be_bytes());
            assert_eq!(&head[4..8], &mask);
        }

        #[test]
        fn test_fmt_head_rejects_64bit_length() {
            let frame = Frame::binary(vec![0u8; MAX_PAYLOAD_LEN + 1]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            assert!(matches!(
                frame.fmt_head(&mut head, None),
                Err(WebSocketError::FrameTooLarge)
            ));
        }
    }

    mod message_tests {
        use super::*;

        #[test]
        fn test_conversions() {
            let text = Message::from("hello");
            assert_eq!(text.opcode(), OpCode::Text);
            assert_eq!(text.as_text(), Some("hello"));
            assert_eq!(text.len(), 5);

            let binary = Message::from(vec![1u8, 2, 3]);
            assert_eq!(binary.opcode(), OpCode::Binary);
            assert_eq!(binary.as_text(), None);
            assert_eq!(binary.into_payload(), Bytes::from_static(&[1, 2, 3]));
        }
    }
}
