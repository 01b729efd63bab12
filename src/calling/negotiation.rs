//! Negotiation decision logic.
//!
//! One engine instance per call. Every inbound signaling event funnels through
//! exactly one method here, which consults [`SessionState`], drives the
//! underlying media engine, and returns the action (if any) for the adapter to
//! emit. The channel delivers at-least-once and unordered, so every method
//! tolerates duplicates and re-validates state after each suspension point.

use std::sync::Arc;

use super::engine::{IceCandidateInit, MediaEngine, SessionDescription};
use super::error::CallError;
use super::session::{OfferFingerprint, SessionState, SignalingPhase};
use super::PeerId;

/// An outbound emission decided by the engine. The adapter owns the wire
/// shape; this is the logical intent.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalAction {
    SendOffer {
        to: PeerId,
        offer: SessionDescription,
    },
    SendAnswer {
        to: PeerId,
        answer: SessionDescription,
    },
}

pub struct NegotiationEngine {
    state: SessionState,
    engine: Arc<dyn MediaEngine>,
    /// Set by the session once local capture is attached; offers are not
    /// generated before then.
    local_media_ready: bool,
    /// Candidates that arrived before any remote description was committed.
    pending_candidates: Vec<IceCandidateInit>,
    remote_description_set: bool,
}

impl NegotiationEngine {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            state: SessionState::new(),
            engine,
            local_media_ready: false,
            pending_candidates: Vec::new(),
            remote_description_set: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.state.remote_peer()
    }

    pub fn set_local_media_ready(&mut self, ready: bool) {
        self.local_media_ready = ready;
    }

    /// A remote party is reachable; initiate a round if this side is in a
    /// position to. Never emits a second offer for the same round.
    pub async fn on_peer_available(
        &mut self,
        peer: &PeerId,
    ) -> Result<Option<SignalAction>, CallError> {
        if !self.state.is_live() {
            return Ok(None);
        }
        self.state.bind_peer(peer)?;

        if !self.local_media_ready {
            tracing::info!("Skipping offer to {}: local media not ready", peer);
            return Ok(None);
        }
        if self.state.phase() != SignalingPhase::Stable || self.state.local_offer_sent() {
            tracing::info!(
                "Skipping offer to {}: phase {:?}, offer outstanding: {}",
                peer,
                self.state.phase(),
                self.state.local_offer_sent()
            );
            return Ok(None);
        }
        if self.state.remote_offer_received() {
            // Glare resolved the other way: they offered first, we answer.
            tracing::info!("Skipping offer to {}: remote offer already recorded", peer);
            return Ok(None);
        }

        let generation = self.state.generation();
        let offer = self.engine.create_offer().await?;
        if !self.state.is_current(generation) {
            tracing::debug!("Discarding offer generated for a torn-down session");
            return Ok(None);
        }

        self.state.note_local_offer();
        tracing::debug!("Offering to {}", peer);
        Ok(Some(SignalAction::SendOffer {
            to: peer.clone(),
            offer,
        }))
    }

    /// Handle an inbound offer: dedup by fingerprint, yield on glare, answer.
    pub async fn on_remote_offer(
        &mut self,
        from: &PeerId,
        offer: SessionDescription,
    ) -> Result<Option<SignalAction>, CallError> {
        if !self.state.is_live() {
            return Ok(None);
        }
        self.state.bind_peer(from)?;

        let fingerprint = OfferFingerprint::of(&offer.sdp);
        if self.state.is_duplicate_offer(&fingerprint) {
            tracing::debug!("Duplicate offer {} from {}, discarding", fingerprint, from);
            return Ok(None);
        }

        let generation = self.state.generation();

        // Glare: this side already offered. The receiver of a conflicting
        // offer always yields — roll back and answer instead of racing.
        if self.state.phase() == SignalingPhase::HaveLocalOffer {
            tracing::info!("Glare with {}: rolling back local offer", from);
            if let Err(e) = self.engine.rollback().await {
                tracing::warn!("Rollback failed: {}", e);
            }
            if !self.state.is_current(generation) {
                return Ok(None);
            }
            self.state.roll_back_local_offer();
        }

        self.state.note_remote_offer(fingerprint);

        let answer = self
            .engine
            .create_answer(&offer)
            .await
            .map_err(|e| CallError::RemoteDescription(e.to_string()))?;
        if !self.state.is_current(generation) {
            tracing::debug!("Discarding answer generated for a torn-down session");
            return Ok(None);
        }

        self.remote_description_set = true;
        self.flush_pending_candidates().await;
        self.state.note_local_answer();
        tracing::debug!("Answering {}", from);
        Ok(Some(SignalAction::SendAnswer {
            to: from.clone(),
            answer,
        }))
    }

    /// Commit an inbound answer. Returns true when the round completed now,
    /// false when the event was a duplicate or arrived in the wrong phase.
    pub async fn on_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<bool, CallError> {
        if !self.state.is_live() {
            return Ok(false);
        }
        if self.state.answer_applied() {
            tracing::debug!("Answer already applied this round, discarding duplicate");
            return Ok(false);
        }
        if self.state.phase() != SignalingPhase::HaveLocalOffer {
            tracing::debug!(
                "Answer arrived in phase {:?} with no offer outstanding, discarding",
                self.state.phase()
            );
            return Ok(false);
        }

        let generation = self.state.generation();
        self.engine
            .apply_remote_answer(&answer)
            .await
            .map_err(|e| CallError::RemoteDescription(e.to_string()))?;
        if !self.state.is_current(generation) {
            return Ok(false);
        }

        self.remote_description_set = true;
        self.flush_pending_candidates().await;
        self.state.note_answer_applied();
        tracing::debug!("Remote answer applied, negotiation stable");
        Ok(true)
    }

    /// Ingest a trickled candidate. Candidates arriving before a remote
    /// description are buffered; individual failures are never fatal.
    pub async fn on_ice_candidate(&mut self, candidate: IceCandidateInit) {
        if !self.state.is_live() {
            return;
        }
        if !self.remote_description_set {
            tracing::debug!("Buffering candidate until a remote description is set");
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.engine.add_ice_candidate(&candidate).await {
            tracing::debug!("Dropping candidate: {}", e);
        }
    }

    /// Tear the session down. Idempotent.
    pub async fn on_call_ended(&mut self) {
        if !self.state.is_live() {
            return;
        }
        self.state.end();
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.engine.close().await;
        tracing::info!("Call ended, session state reset");
    }

    async fn flush_pending_candidates(&mut self) {
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = self.engine.add_ice_candidate(&candidate).await {
                tracing::debug!("Dropping buffered candidate: {}", e);
            }
        }
    }
}
