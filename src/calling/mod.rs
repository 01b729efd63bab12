//! Call signaling core — negotiation state machine, wire adapter, and media
//! session lifecycle for one-to-one calls over a relay channel.
//!
//! One [`CallSession`] backs one call widget: it owns the negotiation engine
//! and media controller, holds a scoped channel subscription, and processes
//! signaling, UI commands, and engine events to completion in arrival order
//! on a single task.

pub mod adapter;
pub mod call_sim;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod media;
pub mod negotiation;
pub mod session;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use self::adapter::{InboundSignal, SignalingAdapter};
use self::engine::{EngineEvent, IceCandidateInit, MediaConstraints, MediaEngine, MediaSource};
use self::error::CallError;
use self::media::{CallStatus, MediaSessionController};
use self::negotiation::{NegotiationEngine, SignalAction};

use crate::relay::{SignalingChannel, Subscription};

/// Identity of a party on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Commands from the UI layer.
#[derive(Debug)]
pub enum CallCommand {
    Start,
    End,
    SetMuted(bool),
    SetVideoEnabled(bool),
    RetryMedia,
}

/// The UI-facing handle to a running call session.
pub struct CallHandle {
    cmd_tx: mpsc::UnboundedSender<CallCommand>,
    status_rx: watch::Receiver<CallStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl CallHandle {
    pub fn start(&self) {
        let _ = self.cmd_tx.send(CallCommand::Start);
    }

    pub fn end(&self) {
        let _ = self.cmd_tx.send(CallCommand::End);
    }

    pub fn set_muted(&self, muted: bool) {
        let _ = self.cmd_tx.send(CallCommand::SetMuted(muted));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        let _ = self.cmd_tx.send(CallCommand::SetVideoEnabled(enabled));
    }

    pub fn retry_media(&self) {
        let _ = self.cmd_tx.send(CallCommand::RetryMedia);
    }

    /// Watch the call status. Cheap to clone per observer.
    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status_rx.clone()
    }

    /// Wait until the session task has fully torn down.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// One call's event loop: signaling frames, UI commands, and engine events
/// are drained in arrival order, each processed to completion.
pub struct CallSession {
    adapter: SignalingAdapter,
    negotiation: NegotiationEngine,
    controller: MediaSessionController,
    media: Arc<dyn MediaEngine>,
    /// Locally gathered candidates waiting for the remote peer to be known.
    pending_local_candidates: Vec<IceCandidateInit>,
}

impl CallSession {
    /// Wire up a session and spawn its event loop.
    ///
    /// Local media is acquired up front; a fatal capture failure leaves the
    /// session idle (the status carries the error and `retry_media` can
    /// recover) rather than failing the spawn.
    pub async fn spawn(
        channel: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaEngine>,
        source: Arc<dyn MediaSource>,
        constraints: MediaConstraints,
    ) -> CallHandle {
        let subscription = channel.subscribe();
        let engine_events = media.take_events();
        let adapter = SignalingAdapter::new(channel);
        let (mut controller, status_rx) = MediaSessionController::new(source, constraints);
        let mut negotiation = NegotiationEngine::new(media.clone());

        match controller.acquire().await {
            Ok(()) => attach_local(&mut negotiation, &controller, &media).await,
            Err(e) => tracing::error!("Session starts without local media: {}", e),
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Self {
            adapter,
            negotiation,
            controller,
            media,
            pending_local_candidates: Vec::new(),
        };
        let task = tokio::spawn(session.run(subscription, cmd_rx, engine_events));
        CallHandle {
            cmd_tx,
            status_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut subscription: Subscription,
        mut cmd_rx: mpsc::UnboundedReceiver<CallCommand>,
        mut engine_events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(CallCommand::End) => {
                        self.hang_up().await;
                        break;
                    }
                    Some(CallCommand::Start) => self.controller.note_connecting(),
                    Some(CallCommand::SetMuted(muted)) => self.controller.set_muted(muted),
                    Some(CallCommand::SetVideoEnabled(on)) => self.controller.set_video_enabled(on),
                    Some(CallCommand::RetryMedia) => self.retry_media().await,
                },
                frame = subscription.recv() => match frame {
                    None => {
                        tracing::warn!("Signaling channel closed, ending call");
                        self.teardown().await;
                        break;
                    }
                    Some(frame) => {
                        if self.handle_frame(frame).await {
                            break;
                        }
                    }
                },
                event = recv_engine_event(&mut engine_events) => match event {
                    Some(EngineEvent::RemoteTrack { kind }) => {
                        tracing::debug!("Remote {:?} track arrived", kind);
                        self.controller.note_remote_track();
                    }
                    Some(EngineEvent::LocalCandidate(candidate)) => {
                        self.trickle(candidate).await;
                    }
                    None => engine_events = None,
                },
            }
        }
    }

    /// Process one inbound frame. Returns true once the session is over.
    async fn handle_frame(&mut self, frame: crate::relay::Frame) -> bool {
        let signal = match SignalingAdapter::decode(&frame) {
            Ok(signal) => signal,
            Err(e) => {
                // Wire noise; drop without involving the user.
                tracing::debug!("Ignoring inbound frame: {}", e);
                return false;
            }
        };

        match signal {
            InboundSignal::PeerJoined { peer } => {
                match self.negotiation.on_peer_available(&peer).await {
                    Ok(Some(action)) => {
                        self.controller.note_connecting();
                        self.emit(action).await;
                        self.flush_local_candidates().await;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Not calling {}: {}", peer, e),
                }
            }
            InboundSignal::IncomingOffer { from, offer } => {
                self.controller.note_connecting();
                match self.negotiation.on_remote_offer(&from, offer).await {
                    Ok(Some(action)) => {
                        self.emit(action).await;
                        self.flush_local_candidates().await;
                    }
                    Ok(None) => {}
                    Err(e @ CallError::PeerMismatch { .. }) => {
                        tracing::warn!("Dropping offer: {}", e);
                    }
                    Err(e) => {
                        self.fail_session(&e).await;
                        return true;
                    }
                }
            }
            InboundSignal::CallAccepted { answer } => {
                match self.negotiation.on_remote_answer(answer).await {
                    Ok(true) => self.controller.note_round_complete(),
                    Ok(false) => {}
                    Err(e) => {
                        self.fail_session(&e).await;
                        return true;
                    }
                }
            }
            InboundSignal::IceCandidate { from: _, candidate } => {
                self.negotiation.on_ice_candidate(candidate).await;
            }
            InboundSignal::CallEnded { from } => {
                tracing::info!("{} ended the call", from);
                self.teardown().await;
                return true;
            }
        }
        false
    }

    async fn emit(&self, action: SignalAction) {
        if let Err(e) = self.adapter.emit_action(action).await {
            tracing::warn!("Failed to emit signaling action: {}", e);
        }
    }

    async fn trickle(&mut self, candidate: IceCandidateInit) {
        match self.negotiation.remote_peer().cloned() {
            Some(peer) => {
                if let Err(e) = self.adapter.emit_candidate(&peer, candidate).await {
                    tracing::debug!("Failed to trickle candidate: {}", e);
                }
            }
            None => self.pending_local_candidates.push(candidate),
        }
    }

    async fn flush_local_candidates(&mut self) {
        if self.negotiation.remote_peer().is_none() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_local_candidates);
        for candidate in pending {
            self.trickle(candidate).await;
        }
    }

    async fn retry_media(&mut self) {
        if self.controller.tracks().is_some() {
            return;
        }
        match self.controller.acquire().await {
            Ok(()) => {
                attach_local(&mut self.negotiation, &self.controller, &self.media).await;
            }
            Err(e) => tracing::error!("Media retry failed: {}", e),
        }
    }

    /// User-initiated hangup: tell the far side, then tear down.
    async fn hang_up(&mut self) {
        if let Some(peer) = self.negotiation.remote_peer().cloned() {
            if let Err(e) = self.adapter.emit_call_ended(&peer).await {
                tracing::debug!("Could not announce hangup: {}", e);
            }
        }
        self.teardown().await;
    }

    /// A fatal call error: announce, tear down, and surface the reason.
    async fn fail_session(&mut self, error: &CallError) {
        tracing::error!("Call failed: {}", error);
        if let Some(peer) = self.negotiation.remote_peer().cloned() {
            let _ = self.adapter.emit_call_ended(&peer).await;
        }
        self.negotiation.on_call_ended().await;
        self.controller.fail_call(&error.to_string());
    }

    async fn teardown(&mut self) {
        self.negotiation.on_call_ended().await;
        self.controller.release();
    }
}

async fn attach_local(
    negotiation: &mut NegotiationEngine,
    controller: &MediaSessionController,
    media: &Arc<dyn MediaEngine>,
) {
    let Some(tracks) = controller.tracks() else {
        return;
    };
    if !tracks.has_any() {
        return;
    }
    match media.attach_local_tracks(tracks).await {
        Ok(()) => negotiation.set_local_media_ready(true),
        Err(e) => tracing::warn!("Failed to attach local tracks: {}", e),
    }
}

async fn recv_engine_event(
    events: &mut Option<mpsc::UnboundedReceiver<EngineEvent>>,
) -> Option<EngineEvent> {
    match events {
        Some(rx) => rx.recv().await,
        // Stream already drained; park this select arm forever.
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::loopback::{LoopbackEngine, LoopbackSource};
    use crate::calling::media::CallPhase;
    use crate::relay::LocalRelay;
    use std::time::Duration;

    async fn wait_until(
        status: &mut watch::Receiver<CallStatus>,
        what: &str,
        predicate: impl FnMut(&CallStatus) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .expect("status channel closed");
    }

    #[tokio::test]
    async fn test_two_sessions_connect_and_hang_up() {
        let relay = LocalRelay::new();

        let alice = CallSession::spawn(
            Arc::new(relay.join(PeerId::from("alice"))),
            Arc::new(LoopbackEngine::new()),
            Arc::new(LoopbackSource::default()),
            MediaConstraints::default(),
        )
        .await;
        alice.start();

        let bob = CallSession::spawn(
            Arc::new(relay.join(PeerId::from("bob"))),
            Arc::new(LoopbackEngine::new()),
            Arc::new(LoopbackSource::default()),
            MediaConstraints::default(),
        )
        .await;

        let mut alice_status = alice.status();
        let mut bob_status = bob.status();
        wait_until(&mut alice_status, "alice connected", |s| {
            s.phase == CallPhase::Connected && s.remote_media
        })
        .await;
        wait_until(&mut bob_status, "bob connected", |s| {
            s.phase == CallPhase::Connected && s.remote_media
        })
        .await;

        alice.end();
        wait_until(&mut alice_status, "alice disconnected", |s| {
            s.phase == CallPhase::Disconnected
        })
        .await;
        wait_until(&mut bob_status, "bob disconnected", |s| {
            s.phase == CallPhase::Disconnected
        })
        .await;
        alice.join().await;
        bob.join().await;
    }

    #[tokio::test]
    async fn test_toggles_reflected_in_status() {
        let relay = LocalRelay::new();
        let handle = CallSession::spawn(
            Arc::new(relay.join(PeerId::from("alice"))),
            Arc::new(LoopbackEngine::new()),
            Arc::new(LoopbackSource::default()),
            MediaConstraints::default(),
        )
        .await;

        let mut status = handle.status();
        handle.set_muted(true);
        handle.set_video_enabled(false);
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| !s.local_tracks.audio && !s.local_tracks.video),
        )
        .await
        .expect("timed out")
        .expect("status channel closed");

        handle.end();
        handle.join().await;
    }

    /// Capture source that fails its first two attempts, then works.
    #[derive(Default)]
    struct FlakySource {
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MediaSource for FlakySource {
        async fn capture(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<engine::LocalTracks, error::MediaError> {
            let n = self
                .attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                return Err(error::MediaError::Capture("device busy".into()));
            }
            Ok(engine::LocalTracks {
                audio: Some(engine::Track::new(engine::TrackKind::Audio)),
                video: constraints
                    .video
                    .as_ref()
                    .map(|_| engine::Track::new(engine::TrackKind::Video)),
            })
        }
    }

    #[tokio::test]
    async fn test_media_retry_recovers_after_fatal_failure() {
        let relay = LocalRelay::new();
        let handle = CallSession::spawn(
            Arc::new(relay.join(PeerId::from("alice"))),
            Arc::new(LoopbackEngine::new()),
            Arc::new(FlakySource::default()),
            MediaConstraints::default(),
        )
        .await;

        let mut status = handle.status();
        {
            let s = status.borrow();
            assert_eq!(s.phase, CallPhase::Idle);
            assert!(s.media_error.is_some());
            assert!(!s.local_tracks.audio);
        }

        handle.retry_media();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.local_tracks.audio && s.local_tracks.video),
        )
        .await
        .expect("timed out")
        .expect("status channel closed");

        handle.end();
        handle.join().await;
    }
}
