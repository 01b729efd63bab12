//! Local media orchestration and UI-observable call status.
//!
//! The controller exclusively owns the capture handle for one call widget:
//! it acquires tracks (degrading to audio-only when video capture fails),
//! applies mute/video toggles at the track level, maps lifecycle transitions
//! onto [`CallPhase`], and releases capture deterministically on teardown.

use std::sync::Arc;

use tokio::sync::watch;

use super::engine::{LocalTracks, MediaConstraints, MediaSource};
use super::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TracksEnabled {
    pub audio: bool,
    pub video: bool,
}

/// What the UI layer sees.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    pub phase: CallPhase,
    pub local_tracks: TracksEnabled,
    pub remote_media: bool,
    /// Warning or error text about local media, user-facing.
    pub media_error: Option<String>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            local_tracks: TracksEnabled::default(),
            remote_media: false,
            media_error: None,
        }
    }
}

pub struct MediaSessionController {
    source: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    tracks: Option<LocalTracks>,
    status: CallStatus,
    status_tx: watch::Sender<CallStatus>,
}

impl MediaSessionController {
    pub fn new(
        source: Arc<dyn MediaSource>,
        constraints: MediaConstraints,
    ) -> (Self, watch::Receiver<CallStatus>) {
        let status = CallStatus::default();
        let (status_tx, status_rx) = watch::channel(status.clone());
        (
            Self {
                source,
                constraints,
                tracks: None,
                status,
                status_tx,
            },
            status_rx,
        )
    }

    pub fn tracks(&self) -> Option<&LocalTracks> {
        self.tracks.as_ref()
    }

    /// Acquire local capture, degrading to audio-only when full capture
    /// fails. A fatal failure leaves the phase at `Idle` with the error text
    /// in the status; the user may retry.
    pub async fn acquire(&mut self) -> Result<(), CallError> {
        match self.source.capture(&self.constraints).await {
            Ok(tracks) => {
                self.install_tracks(tracks, None);
                Ok(())
            }
            Err(e) if self.constraints.video.is_some() => {
                tracing::warn!("Full capture failed ({}), retrying audio-only", e);
                match self.source.capture(&self.constraints.audio_only()).await {
                    Ok(tracks) => {
                        self.install_tracks(
                            tracks,
                            Some(format!(
                                "Video capture unavailable ({}); continuing audio-only",
                                e
                            )),
                        );
                        Ok(())
                    }
                    Err(audio_err) => Err(self.fail_acquire(audio_err.to_string())),
                }
            }
            Err(e) => Err(self.fail_acquire(e.to_string())),
        }
    }

    fn install_tracks(&mut self, tracks: LocalTracks, warning: Option<String>) {
        self.status.local_tracks = TracksEnabled {
            audio: tracks.audio.as_ref().map(|t| t.is_enabled()).unwrap_or(false),
            video: tracks.video.as_ref().map(|t| t.is_enabled()).unwrap_or(false),
        };
        self.status.media_error = warning;
        self.tracks = Some(tracks);
        self.publish();
    }

    fn fail_acquire(&mut self, reason: String) -> CallError {
        tracing::error!("Local media unavailable: {}", reason);
        self.status.media_error = Some(format!(
            "Could not access camera or microphone: {}. Check device permissions and retry.",
            reason
        ));
        self.publish();
        CallError::MediaUnavailable(reason)
    }

    /// Mute or unmute the microphone. Track-level toggle, no renegotiation.
    pub fn set_muted(&mut self, muted: bool) {
        if let Some(track) = self.tracks.as_ref().and_then(|t| t.audio.as_ref()) {
            track.set_enabled(!muted);
            self.status.local_tracks.audio = !muted;
            self.publish();
        }
    }

    /// Enable or disable the camera track.
    pub fn set_video_enabled(&mut self, enabled: bool) {
        if let Some(track) = self.tracks.as_ref().and_then(|t| t.video.as_ref()) {
            track.set_enabled(enabled);
            self.status.local_tracks.video = enabled;
            self.publish();
        }
    }

    /// Call start or room join.
    pub fn note_connecting(&mut self) {
        if self.status.phase == CallPhase::Idle {
            self.status.phase = CallPhase::Connecting;
            self.publish();
        }
    }

    /// The negotiation round completed (answer applied). First of this and
    /// [`note_remote_track`](Self::note_remote_track) wins; the other is a
    /// no-op.
    pub fn note_round_complete(&mut self) {
        if self.status.phase == CallPhase::Connecting || self.status.phase == CallPhase::Idle {
            self.status.phase = CallPhase::Connected;
            self.publish();
        }
    }

    /// A remote media track arrived.
    pub fn note_remote_track(&mut self) {
        let mut changed = !self.status.remote_media;
        self.status.remote_media = true;
        if self.status.phase == CallPhase::Connecting || self.status.phase == CallPhase::Idle {
            self.status.phase = CallPhase::Connected;
            changed = true;
        }
        if changed {
            self.publish();
        }
    }

    /// The remote description failed or the far side is gone: the call is
    /// over and the user should know why.
    pub fn fail_call(&mut self, reason: &str) {
        self.status.media_error = Some(reason.to_string());
        self.release();
    }

    /// Stop local capture and end the session's media. Runs on every exit
    /// path; idempotent.
    pub fn release(&mut self) {
        if let Some(tracks) = self.tracks.take() {
            tracks.stop_all();
        }
        self.status.local_tracks = TracksEnabled::default();
        self.status.remote_media = false;
        if self.status.phase != CallPhase::Idle {
            self.status.phase = CallPhase::Disconnected;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }
}
