use std::time::Duration;

/// Default cap on a reassembled message: 1 MiB.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Per-connection settings applied to every upgraded socket.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsrelay::Options;
///
/// let options = Options::default()
///     .with_idle_timeout(Duration::from_secs(60))
///     .with_max_message_size(256 * 1024);
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum size of a message reassembled from fragments, in bytes.
    ///
    /// A single frame is always limited to 65535 bytes by the wire format; this bounds how many
    /// of them a peer can chain into one message.
    ///
    /// Default: 1 MiB as defined in [`MAX_MESSAGE_SIZE`]
    pub max_message_size: usize,

    /// How long a peer may stay silent before it is closed with code 1001.
    ///
    /// Default: `None`, a silent peer keeps its connection open until it disconnects.
    pub idle_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            idle_timeout: None,
        }
    }
}

impl Options {
    /// Sets the maximum size of a reassembled message.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: size,
            ..self
        }
    }

    /// Closes peers that send nothing for `timeout`.
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
            ..self
        }
    }

    /// Keeps silent peers open indefinitely.
    pub fn without_idle_timeout(self) -> Self {
        Self {
            idle_timeout: None,
            ..self
        }
    }
}
