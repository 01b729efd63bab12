//! Per-call negotiation state.
//!
//! `SessionState` is the single value object every negotiation decision is
//! checked against. It mirrors the underlying signaling phase, remembers the
//! fingerprint of the last processed offer for duplicate suppression, and
//! carries a generation counter that invalidates in-flight async results once
//! the call is torn down.

use std::fmt;

use sha2::{Digest, Sha256};

use super::error::CallError;
use super::PeerId;

/// Mirror of the underlying connection's signaling phase. Authoritative for
/// deciding which negotiation actions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Content signature of an inbound offer, used to detect re-delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferFingerprint(String);

impl OfferFingerprint {
    pub fn of(sdp: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(sdp.as_bytes())))
    }
}

impl fmt::Display for OfferFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full digests are noise in logs.
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// Negotiation progress for one call.
#[derive(Debug)]
pub struct SessionState {
    local_offer_sent: bool,
    remote_offer_received: bool,
    answer_applied: bool,
    last_offer_fingerprint: Option<OfferFingerprint>,
    remote_peer: Option<PeerId>,
    phase: SignalingPhase,
    generation: u64,
    ended: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            local_offer_sent: false,
            remote_offer_received: false,
            answer_applied: false,
            last_offer_fingerprint: None,
            remote_peer: None,
            phase: SignalingPhase::Stable,
            generation: 0,
            ended: false,
        }
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.remote_peer.as_ref()
    }

    pub fn local_offer_sent(&self) -> bool {
        self.local_offer_sent
    }

    pub fn remote_offer_received(&self) -> bool {
        self.remote_offer_received
    }

    pub fn answer_applied(&self) -> bool {
        self.answer_applied
    }

    pub fn is_live(&self) -> bool {
        !self.ended
    }

    /// Current generation. Capture before an `.await`, re-check with
    /// [`is_current`](Self::is_current) after it resumes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        !self.ended && self.generation == generation
    }

    /// Record the far side's identity, set on first signaling contact.
    ///
    /// A second peer naming this session is rejected; one state object backs
    /// exactly one pairwise call.
    pub fn bind_peer(&mut self, peer: &PeerId) -> Result<(), CallError> {
        match &self.remote_peer {
            None => {
                self.remote_peer = Some(peer.clone());
                Ok(())
            }
            Some(known) if known == peer => Ok(()),
            Some(known) => Err(CallError::PeerMismatch {
                expected: known.clone(),
                got: peer.clone(),
            }),
        }
    }

    /// A local offer was generated and is about to be emitted. Starts a new
    /// negotiation round.
    pub fn note_local_offer(&mut self) {
        debug_assert_eq!(self.phase, SignalingPhase::Stable);
        self.local_offer_sent = true;
        self.answer_applied = false;
        self.phase = SignalingPhase::HaveLocalOffer;
    }

    /// True when this offer's fingerprint matches the last one processed.
    pub fn is_duplicate_offer(&self, fingerprint: &OfferFingerprint) -> bool {
        self.last_offer_fingerprint.as_ref() == Some(fingerprint)
    }

    /// A fresh remote offer was accepted. Starts (or restarts) a round on the
    /// callee side.
    pub fn note_remote_offer(&mut self, fingerprint: OfferFingerprint) {
        debug_assert_ne!(self.phase, SignalingPhase::HaveLocalOffer);
        self.remote_offer_received = true;
        self.last_offer_fingerprint = Some(fingerprint);
        self.phase = SignalingPhase::HaveRemoteOffer;
    }

    /// The pending local offer was rolled back to yield to a remote one.
    pub fn roll_back_local_offer(&mut self) {
        debug_assert_eq!(self.phase, SignalingPhase::HaveLocalOffer);
        self.local_offer_sent = false;
        self.phase = SignalingPhase::Stable;
    }

    /// A local answer was generated for the recorded remote offer.
    pub fn note_local_answer(&mut self) {
        debug_assert_eq!(self.phase, SignalingPhase::HaveRemoteOffer);
        self.phase = SignalingPhase::Stable;
    }

    /// Commit the remote answer. Returns false if one was already applied
    /// this round (duplicate delivery).
    pub fn note_answer_applied(&mut self) -> bool {
        if self.answer_applied {
            return false;
        }
        self.answer_applied = true;
        self.local_offer_sent = false;
        self.phase = SignalingPhase::Stable;
        true
    }

    /// Tear down: reset to the pre-call shape and invalidate anything still
    /// in flight. Idempotent.
    pub fn end(&mut self) {
        self.local_offer_sent = false;
        self.remote_offer_received = false;
        self.answer_applied = false;
        self.last_offer_fingerprint = None;
        self.remote_peer = None;
        self.phase = SignalingPhase::Stable;
        self.generation += 1;
        self.ended = true;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_matches_same_body() {
        let a = OfferFingerprint::of("v=0\r\nm=audio 9 RTP/AVP 0\r\n");
        let b = OfferFingerprint::of("v=0\r\nm=audio 9 RTP/AVP 0\r\n");
        let c = OfferFingerprint::of("v=0\r\nm=audio 9 RTP/AVP 8\r\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_duplicate_offer_gate() {
        let mut state = SessionState::new();
        let fp = OfferFingerprint::of("sdp-body");
        assert!(!state.is_duplicate_offer(&fp));
        state.note_remote_offer(fp.clone());
        assert!(state.is_duplicate_offer(&fp));
        assert!(!state.is_duplicate_offer(&OfferFingerprint::of("other")));
    }

    #[test]
    fn test_caller_round_reaches_stable_only_via_answer() {
        let mut state = SessionState::new();
        state.note_local_offer();
        assert_eq!(state.phase(), SignalingPhase::HaveLocalOffer);
        assert!(state.note_answer_applied());
        assert_eq!(state.phase(), SignalingPhase::Stable);
        // Second answer for the same round is refused.
        assert!(!state.note_answer_applied());
    }

    #[test]
    fn test_callee_round_reaches_stable_via_local_answer() {
        let mut state = SessionState::new();
        state.note_remote_offer(OfferFingerprint::of("offer"));
        assert_eq!(state.phase(), SignalingPhase::HaveRemoteOffer);
        state.note_local_answer();
        assert_eq!(state.phase(), SignalingPhase::Stable);
    }

    #[test]
    fn test_rollback_clears_local_offer() {
        let mut state = SessionState::new();
        state.note_local_offer();
        state.roll_back_local_offer();
        assert!(!state.local_offer_sent());
        assert_eq!(state.phase(), SignalingPhase::Stable);
    }

    #[test]
    fn test_bind_peer_rejects_second_identity() {
        let mut state = SessionState::new();
        state.bind_peer(&PeerId::from("alice")).unwrap();
        state.bind_peer(&PeerId::from("alice")).unwrap();
        let err = state.bind_peer(&PeerId::from("mallory")).unwrap_err();
        assert!(matches!(err, CallError::PeerMismatch { .. }));
    }

    #[test]
    fn test_end_resets_to_pre_call_shape_and_bumps_generation() {
        let mut state = SessionState::new();
        let before = state.generation();
        state.bind_peer(&PeerId::from("alice")).unwrap();
        state.note_local_offer();
        state.end();

        assert!(!state.is_live());
        assert!(!state.is_current(before));
        assert!(!state.local_offer_sent());
        assert!(state.remote_peer().is_none());
        assert_eq!(state.phase(), SignalingPhase::Stable);
        // A second end is harmless.
        state.end();
    }
}
