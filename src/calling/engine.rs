//! Media-engine and capture boundaries.
//!
//! The actual media stack (description generation, transport, codecs, NAT
//! traversal) lives behind [`MediaEngine`]; local capture devices live behind
//! [`MediaSource`]. This crate only orchestrates them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::{EngineError, MediaError};

/// Which half of the description exchange a blob is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// A trickled connectivity candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track.
///
/// The enabled flag is shared with whatever the engine attached, so mute and
/// video toggles take effect without renegotiation. Stopping is terminal.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Track {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// The set of local tracks captured for a call.
#[derive(Debug, Clone, Default)]
pub struct LocalTracks {
    pub audio: Option<Track>,
    pub video: Option<Track>,
}

impl LocalTracks {
    pub fn has_any(&self) -> bool {
        self.audio.is_some() || self.video.is_some()
    }

    /// Stop every track. Idempotent.
    pub fn stop_all(&self) {
        if let Some(t) = &self.audio {
            t.stop();
        }
        if let Some(t) = &self.video {
            t.stop();
        }
    }
}

/// Requested capture parameters, mirroring the constraint set the client
/// passes to the capture device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    /// `None` requests an audio-only capture.
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: Some(VideoConstraints::default()),
        }
    }
}

impl MediaConstraints {
    /// The same constraints with video dropped, for the degraded retry.
    pub fn audio_only(&self) -> Self {
        Self {
            audio: self.audio.clone(),
            video: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Ideal capture dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Events the engine surfaces while a session runs.
#[derive(Debug)]
pub enum EngineEvent {
    /// A remote media track arrived.
    RemoteTrack { kind: TrackKind },
    /// The engine gathered a local candidate to trickle to the peer.
    LocalCandidate(IceCandidateInit),
}

/// The negotiation capability consumed by the calling core.
///
/// One engine instance backs exactly one call; it is closed on teardown and
/// never reused.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Generate a local offer and install it as the pending local description.
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Apply a remote offer and generate the matching answer.
    async fn create_answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError>;

    /// Commit a remote answer against the pending local offer.
    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<(), EngineError>;

    /// Discard the pending local offer.
    async fn rollback(&self) -> Result<(), EngineError>;

    /// Ingest a trickled remote candidate.
    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), EngineError>;

    /// Attach local capture tracks for sending. Re-attaching the same tracks
    /// is a no-op.
    async fn attach_local_tracks(&self, tracks: &LocalTracks) -> Result<(), EngineError>;

    /// The current local description, if any.
    fn local_description(&self) -> Option<SessionDescription>;

    /// Take the engine's event stream. Yields `None` once taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;

    /// Discard the underlying connection. Idempotent.
    async fn close(&self);
}

/// Local capture capability.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalTracks, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_toggle_is_shared() {
        let track = Track::new(TrackKind::Audio);
        let attached = track.clone();
        track.set_enabled(false);
        assert!(!attached.is_enabled());
        track.set_enabled(true);
        assert!(attached.is_enabled());
    }

    #[test]
    fn test_stop_all_is_idempotent() {
        let tracks = LocalTracks {
            audio: Some(Track::new(TrackKind::Audio)),
            video: Some(Track::new(TrackKind::Video)),
        };
        tracks.stop_all();
        tracks.stop_all();
        assert!(tracks.audio.as_ref().unwrap().is_stopped());
        assert!(tracks.video.as_ref().unwrap().is_stopped());
    }

    #[test]
    fn test_candidate_wire_shape() {
        let c = IceCandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 10.0.0.1 21730 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["sdpMid"], "0");
        assert_eq!(v["sdpMlineIndex"], 0);
    }

    #[test]
    fn test_description_wire_shape() {
        let d = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n".into(),
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["type"], "offer");
    }
}
