//! Wire contract of the signaling channel.
//!
//! The adapter is a pure translation layer: inbound frames are validated and
//! decoded into [`InboundSignal`]s before any negotiation logic sees them,
//! and engine actions are serialized back onto the channel. No call decisions
//! are made here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::engine::{IceCandidateInit, SessionDescription};
use super::error::CallError;
use super::negotiation::SignalAction;
use super::PeerId;
use crate::relay::{Frame, SignalingChannel};

pub const EV_PEER_JOINED: &str = "peer-joined";
pub const EV_INCOMING_OFFER: &str = "incoming-offer";
pub const EV_CALL_ACCEPTED: &str = "call-accepted";
pub const EV_ICE_CANDIDATE: &str = "ice-candidate";
pub const EV_CALL_ENDED: &str = "call-ended";
pub const EV_CALL_USER: &str = "call-user";

/// A validated inbound signaling event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    PeerJoined { peer: PeerId },
    IncomingOffer { from: PeerId, offer: SessionDescription },
    CallAccepted { answer: SessionDescription },
    IceCandidate { from: PeerId, candidate: IceCandidateInit },
    CallEnded { from: PeerId },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerJoinedPayload {
    peer_id: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
struct IncomingOfferPayload {
    from: PeerId,
    offer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct InboundAnswerPayload {
    answer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct InboundCandidatePayload {
    from: PeerId,
    candidate: IceCandidateInit,
}

#[derive(Debug, Serialize, Deserialize)]
struct InboundEndPayload {
    from: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallUserPayload {
    peer_id: PeerId,
    offer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallAcceptedPayload {
    peer_id: PeerId,
    answer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutboundCandidatePayload {
    peer_id: PeerId,
    candidate: IceCandidateInit,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallEndedPayload {
    peer_id: PeerId,
}

pub struct SignalingAdapter {
    channel: Arc<dyn SignalingChannel>,
}

impl SignalingAdapter {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    /// Validate and decode one inbound frame.
    pub fn decode(frame: &Frame) -> Result<InboundSignal, CallError> {
        fn payload<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Result<T, CallError> {
            serde_json::from_value(frame.payload.clone()).map_err(|e| CallError::MalformedSignal {
                event: frame.event.clone(),
                reason: e.to_string(),
            })
        }

        match frame.event.as_str() {
            EV_PEER_JOINED => {
                let p: PeerJoinedPayload = payload(frame)?;
                Ok(InboundSignal::PeerJoined { peer: p.peer_id })
            }
            EV_INCOMING_OFFER => {
                let p: IncomingOfferPayload = payload(frame)?;
                Ok(InboundSignal::IncomingOffer {
                    from: p.from,
                    offer: p.offer,
                })
            }
            EV_CALL_ACCEPTED => {
                let p: InboundAnswerPayload = payload(frame)?;
                Ok(InboundSignal::CallAccepted { answer: p.answer })
            }
            EV_ICE_CANDIDATE => {
                let p: InboundCandidatePayload = payload(frame)?;
                Ok(InboundSignal::IceCandidate {
                    from: p.from,
                    candidate: p.candidate,
                })
            }
            EV_CALL_ENDED => {
                let p: InboundEndPayload = payload(frame)?;
                Ok(InboundSignal::CallEnded { from: p.from })
            }
            other => Err(CallError::MalformedSignal {
                event: other.to_string(),
                reason: "unknown event".into(),
            }),
        }
    }

    /// Emit a negotiation action.
    pub async fn emit_action(&self, action: SignalAction) -> Result<(), CallError> {
        let frame = match action {
            SignalAction::SendOffer { to, offer } => {
                encode(EV_CALL_USER, &CallUserPayload { peer_id: to, offer })?
            }
            SignalAction::SendAnswer { to, answer } => encode(
                EV_CALL_ACCEPTED,
                &CallAcceptedPayload {
                    peer_id: to,
                    answer,
                },
            )?,
        };
        self.channel
            .emit(frame)
            .await
            .map_err(|_| CallError::ChannelClosed)
    }

    /// Trickle a locally gathered candidate to the peer.
    pub async fn emit_candidate(
        &self,
        to: &PeerId,
        candidate: IceCandidateInit,
    ) -> Result<(), CallError> {
        let frame = encode(
            EV_ICE_CANDIDATE,
            &OutboundCandidatePayload {
                peer_id: to.clone(),
                candidate,
            },
        )?;
        self.channel
            .emit(frame)
            .await
            .map_err(|_| CallError::ChannelClosed)
    }

    /// Announce hangup to the peer.
    pub async fn emit_call_ended(&self, to: &PeerId) -> Result<(), CallError> {
        let frame = encode(
            EV_CALL_ENDED,
            &CallEndedPayload {
                peer_id: to.clone(),
            },
        )?;
        self.channel
            .emit(frame)
            .await
            .map_err(|_| CallError::ChannelClosed)
    }
}

fn encode<T: Serialize>(event: &str, payload: &T) -> Result<Frame, CallError> {
    let value = serde_json::to_value(payload).map_err(|e| CallError::MalformedSignal {
        event: event.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Frame::new(event, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::engine::SdpKind;
    use crate::relay::{LocalRelay, RelayError};
    use async_trait::async_trait;
    use serde_json::json;

    #[test]
    fn test_decode_peer_joined() {
        let frame = Frame::new(EV_PEER_JOINED, json!({ "peerId": "bob" }));
        let signal = SignalingAdapter::decode(&frame).unwrap();
        assert_eq!(
            signal,
            InboundSignal::PeerJoined {
                peer: PeerId::from("bob")
            }
        );
    }

    #[test]
    fn test_decode_incoming_offer() {
        let frame = Frame::new(
            EV_INCOMING_OFFER,
            json!({ "from": "alice", "offer": { "type": "offer", "sdp": "v=0\r\n" } }),
        );
        match SignalingAdapter::decode(&frame).unwrap() {
            InboundSignal::IncomingOffer { from, offer } => {
                assert_eq!(from, PeerId::from("alice"));
                assert_eq!(offer.kind, SdpKind::Offer);
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let frame = Frame::new(EV_INCOMING_OFFER, json!({ "from": "alice" }));
        let err = SignalingAdapter::decode(&frame).unwrap_err();
        assert!(matches!(err, CallError::MalformedSignal { .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        let frame = Frame::new("renegotiate-v2", json!({}));
        let err = SignalingAdapter::decode(&frame).unwrap_err();
        assert!(matches!(err, CallError::MalformedSignal { .. }));
    }

    #[tokio::test]
    async fn test_emitted_offer_wire_shape() {
        // Capture the raw frame with a stub channel.
        struct Capture(std::sync::Mutex<Vec<Frame>>);
        #[async_trait]
        impl SignalingChannel for Capture {
            async fn emit(&self, frame: Frame) -> Result<(), RelayError> {
                self.0.lock().unwrap().push(frame);
                Ok(())
            }
            fn subscribe(&self) -> crate::relay::Subscription {
                unimplemented!("not used")
            }
        }

        let capture = Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
        let adapter = SignalingAdapter::new(capture.clone());
        adapter
            .emit_action(SignalAction::SendOffer {
                to: PeerId::from("bob"),
                offer: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0\r\n".into(),
                },
            })
            .await
            .unwrap();

        let frames = capture.0.lock().unwrap();
        assert_eq!(frames[0].event, EV_CALL_USER);
        assert_eq!(frames[0].payload["peerId"], "bob");
        assert_eq!(frames[0].payload["offer"]["type"], "offer");
    }

    #[test]
    fn test_round_trip_through_relay() {
        tokio_test::block_on(async {
            let relay = LocalRelay::new();
            let alice = Arc::new(relay.join(PeerId::from("alice")));
            let bob = relay.join(PeerId::from("bob"));
            let mut bob_sub = bob.subscribe();

            let adapter = SignalingAdapter::new(alice);
            adapter
                .emit_candidate(
                    &PeerId::from("bob"),
                    IceCandidateInit {
                        candidate: "candidate:1 1 UDP 1 10.0.0.1 9 typ host".into(),
                        sdp_mid: None,
                        sdp_mline_index: Some(0),
                    },
                )
                .await
                .unwrap();

            let frame = bob_sub.recv().await.unwrap();
            match SignalingAdapter::decode(&frame).unwrap() {
                InboundSignal::IceCandidate { from, candidate } => {
                    assert_eq!(from, PeerId::from("alice"));
                    assert_eq!(candidate.sdp_mline_index, Some(0));
                }
                other => panic!("unexpected signal: {:?}", other),
            }
        });
    }
}
