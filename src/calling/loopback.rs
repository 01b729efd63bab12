//! In-process media engine and capture source.
//!
//! Good enough to negotiate against without any device or network: offers and
//! answers are minimal SDP bodies, remote tracks are synthesized from the
//! m-lines of whatever remote description is applied, and one host candidate
//! is trickled per local description. Used by the unit tests and the loopback
//! simulation.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::engine::{
    EngineEvent, IceCandidateInit, LocalTracks, MediaConstraints, MediaEngine, MediaSource,
    SdpKind, SessionDescription, Track, TrackKind,
};
use super::error::{EngineError, MediaError};

struct Inner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    attached: Option<LocalTracks>,
    candidates: Vec<IceCandidateInit>,
    closed: bool,
    version: u64,
    rollbacks: u64,
    applied_answers: u64,
    closes: u64,
    events_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

pub struct LoopbackEngine {
    session_id: u32,
    inner: Mutex<Inner>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();
        let bytes = id.as_bytes();
        let session_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self {
            session_id,
            inner: Mutex::new(Inner {
                local: None,
                remote: None,
                attached: None,
                candidates: Vec::new(),
                closed: false,
                version: 0,
                rollbacks: 0,
                applied_answers: 0,
                closes: 0,
                events_tx: Some(events_tx),
                events_rx: Some(events_rx),
            }),
        }
    }

    pub fn rollback_count(&self) -> u64 {
        self.lock().rollbacks
    }

    pub fn applied_answer_count(&self) -> u64 {
        self.lock().applied_answers
    }

    pub fn candidate_count(&self) -> usize {
        self.lock().candidates.len()
    }

    pub fn close_count(&self) -> u64 {
        self.lock().closes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("loopback engine poisoned")
    }

    fn build_description(&self, inner: &mut Inner, kind: SdpKind) -> SessionDescription {
        inner.version += 1;
        let has_video = inner
            .attached
            .as_ref()
            .map(|t| t.video.is_some())
            .unwrap_or(false);
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id, inner.version
        );
        sdp.push_str("m=audio 9 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n");
        if has_video {
            sdp.push_str("m=video 9 RTP/AVP 96\r\na=rtpmap:96 VP8/90000\r\n");
        }
        SessionDescription { kind, sdp }
    }

    fn emit_remote_tracks(inner: &Inner, sdp: &str) {
        let Some(tx) = inner.events_tx.as_ref() else {
            return;
        };
        for line in sdp.lines() {
            let kind = if line.starts_with("m=audio") {
                TrackKind::Audio
            } else if line.starts_with("m=video") {
                TrackKind::Video
            } else {
                continue;
            };
            let _ = tx.send(EngineEvent::RemoteTrack { kind });
        }
    }

    fn trickle_host_candidate(inner: &Inner) {
        if let Some(tx) = inner.events_tx.as_ref() {
            let _ = tx.send(EngineEvent::LocalCandidate(IceCandidateInit {
                candidate: "candidate:1 1 UDP 2130706431 127.0.0.1 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        let offer = self.build_description(&mut inner, SdpKind::Offer);
        inner.local = Some(offer.clone());
        Self::trickle_host_candidate(&inner);
        Ok(offer)
    }

    async fn create_answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        if offer.kind != SdpKind::Offer {
            return Err(EngineError::Description(
                "cannot answer a non-offer description".into(),
            ));
        }
        inner.remote = Some(offer.clone());
        Self::emit_remote_tracks(&inner, &offer.sdp);
        let answer = self.build_description(&mut inner, SdpKind::Answer);
        inner.local = Some(answer.clone());
        Self::trickle_host_candidate(&inner);
        Ok(answer)
    }

    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        if answer.kind != SdpKind::Answer {
            return Err(EngineError::Description("expected an answer".into()));
        }
        match inner.local.as_ref() {
            Some(local) if local.kind == SdpKind::Offer => {}
            _ => {
                return Err(EngineError::Description(
                    "no pending local offer to answer".into(),
                ))
            }
        }
        inner.remote = Some(answer.clone());
        inner.applied_answers += 1;
        Self::emit_remote_tracks(&inner, &answer.sdp);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        if !matches!(inner.local.as_ref(), Some(d) if d.kind == SdpKind::Offer) {
            return Err(EngineError::Negotiation("no pending offer to roll back".into()));
        }
        inner.local = None;
        inner.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        if inner.remote.is_none() {
            return Err(EngineError::Candidate("no remote description".into()));
        }
        inner.candidates.push(candidate.clone());
        Ok(())
    }

    async fn attach_local_tracks(&self, tracks: &LocalTracks) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        for track in [&tracks.audio, &tracks.video].into_iter().flatten() {
            tracing::debug!("Attached local {:?} track {}", track.kind, track.id);
        }
        inner.attached = Some(tracks.clone());
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.lock().events_rx.take()
    }

    async fn close(&self) {
        let mut inner = self.lock();
        if !inner.closed {
            inner.closed = true;
            inner.closes += 1;
            // Ends the event stream for whoever is draining it.
            inner.events_tx = None;
        }
    }
}

/// Capture source with injectable failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackSource {
    pub fail_video: bool,
    pub fail_audio: bool,
}

#[async_trait]
impl MediaSource for LoopbackSource {
    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalTracks, MediaError> {
        if self.fail_audio {
            return Err(MediaError::Capture("audio device busy".into()));
        }
        if constraints.video.is_some() && self.fail_video {
            return Err(MediaError::Capture("video device unavailable".into()));
        }
        Ok(LocalTracks {
            audio: Some(Track::new(TrackKind::Audio)),
            video: constraints
                .video
                .as_ref()
                .map(|_| Track::new(TrackKind::Video)),
        })
    }
}
