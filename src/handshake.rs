//! The opening handshake ([RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)).
//!
//! [`validate`] checks the upgrade request headers and computes the `Sec-WebSocket-Accept` value;
//! [`response`] and [`raw_response`] build the `101 Switching Protocols` answer for a hyper
//! connection and a raw stream respectively.

use base64::prelude::*;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Response, StatusCode,
};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing.
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Why an upgrade request was refused. Every variant answers `400 Bad Request`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Connection header does not contain the Upgrade token")]
    InvalidConnectionHeader,

    #[error("Upgrade header does not contain websocket")]
    InvalidUpgradeHeader,

    #[error("Unsupported Sec-WebSocket-Version, only 13 is accepted")]
    InvalidSecWebsocketVersion,

    #[error("Missing Sec-WebSocket-Key header")]
    MissingSecWebSocketKey,
}

impl HandshakeError {
    /// HTTP status to answer the failed upgrade with.
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    /// Short reason, suitable for a response body.
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeError::InvalidConnectionHeader => "invalid Connection header",
            HandshakeError::InvalidUpgradeHeader => "invalid Upgrade header",
            HandshakeError::InvalidSecWebsocketVersion => "unsupported WebSocket version",
            HandshakeError::MissingSecWebSocketKey => "missing Sec-WebSocket-Key",
        }
    }
}

/// Validates an upgrade request and returns its `Sec-WebSocket-Accept` value.
///
/// The checks run in order and the first failure is reported:
/// 1. `Connection` contains the `Upgrade` token,
/// 2. `Upgrade` contains `websocket`,
/// 3. `Sec-WebSocket-Version` contains `13`,
/// 4. `Sec-WebSocket-Key` is present.
///
/// Token matching is case-insensitive and looks at every value of a header as well as every
/// entry of comma-separated lists, so `Connection: keep-alive, Upgrade` qualifies.
pub fn validate(headers: &HeaderMap) -> Result<String, HandshakeError> {
    if !has_token(headers, header::CONNECTION, "upgrade") {
        return Err(HandshakeError::InvalidConnectionHeader);
    }
    if !has_token(headers, header::UPGRADE, "websocket") {
        return Err(HandshakeError::InvalidUpgradeHeader);
    }
    if !has_token(headers, header::SEC_WEBSOCKET_VERSION, "13") {
        return Err(HandshakeError::InvalidSecWebsocketVersion);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(HeaderValue::as_bytes)
        .map(<[u8]>::trim_ascii)
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingSecWebSocketKey)?;

    Ok(accept_key(key))
}

/// Computes `base64(sha1(key + GUID))`.
pub fn accept_key(key: impl AsRef<[u8]>) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_ref());
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// The `101 Switching Protocols` response for hyper.
pub fn response(accept: &str) -> Response<Empty<Bytes>> {
    let mut response = Response::new(Empty::new());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    // base64 output is always a valid header value
    if let Ok(accept) = HeaderValue::from_str(accept) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }

    response
}

/// The same response serialized for a raw stream.
pub fn raw_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
    .into_bytes()
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}
