//! Handlers shipped with the crate.
//!
//! - [`SignalingRelay`]: forwards WebRTC session negotiation between two peers by id.
//! - [`BroadcastLogger`]: logs traffic and relays every text message to all other peers.

mod broadcast;
mod signaling;

pub use broadcast::BroadcastLogger;
pub use signaling::{SignalingRelay, SEPARATOR};
