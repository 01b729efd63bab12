//! Error taxonomy for the calling core.
//!
//! Split by blast radius: wire noise is dropped after a debug log, local-media
//! problems degrade or block call start, and a rejected remote description is
//! fatal to the call but never to the process.

use thiserror::Error;

use super::PeerId;

/// Failures reported by a [`MediaEngine`](super::engine::MediaEngine)
/// implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Offer or answer generation failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// A session description was rejected as malformed or incompatible.
    #[error("description rejected: {0}")]
    Description(String),
    /// A connectivity candidate could not be ingested.
    #[error("candidate rejected: {0}")]
    Candidate(String),
    /// The engine was already closed.
    #[error("media engine closed")]
    Closed,
}

/// Failures reported by a [`MediaSource`](super::engine::MediaSource).
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Top-level call errors.
#[derive(Debug, Error)]
pub enum CallError {
    /// An inbound frame did not match the wire contract. Transient signaling
    /// noise; logged and dropped, never surfaced to the user.
    #[error("malformed signal `{event}`: {reason}")]
    MalformedSignal { event: String, reason: String },

    /// A signaling event named a peer other than the one this session is
    /// negotiating with.
    #[error("signal from {got} while negotiating with {expected}")]
    PeerMismatch { expected: PeerId, got: PeerId },

    /// Local media could not be acquired at all. Fatal to starting a call;
    /// the user may retry.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    /// The remote description could not be applied. Fatal to the call: the
    /// session is torn down and the user notified.
    #[error("remote description failed: {0}")]
    RemoteDescription(String),

    /// The media engine failed outside of description application.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The signaling channel is gone.
    #[error("signaling channel closed")]
    ChannelClosed,
}
