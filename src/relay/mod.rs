//! Signaling-channel boundary and the in-memory relay.
//!
//! The production relay is an external service; this module defines the
//! channel trait the calling core is written against, plus `LocalRelay`, an
//! in-process two-party room with the same routing behavior, used by tests
//! and the loopback simulation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::calling::PeerId;

/// One event on the signaling channel: a logical event name plus its JSON
/// payload. The adapter owns what goes inside.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no such peer in room: {0}")]
    UnknownPeer(PeerId),
    #[error("unroutable event `{0}`")]
    Unroutable(String),
}

/// A live subscription to inbound frames. Dropping it detaches the
/// subscriber — the disposer that replaces ad-hoc handler registration.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Frame>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

struct SubscriptionGuard {
    room: Arc<Mutex<RoomState>>,
    peer: PeerId,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Ok(mut room) = self.room.lock() {
            if let Some(member) = room.members.get_mut(&self.peer) {
                member.subscribers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Bidirectional event channel to the relay, scoped to one local peer.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn emit(&self, frame: Frame) -> Result<(), RelayError>;
    fn subscribe(&self) -> Subscription;
}

#[derive(Default)]
struct Member {
    subscribers: Vec<(u64, mpsc::UnboundedSender<Frame>)>,
    /// Frames that arrived between joining and the first subscribe. Replayed
    /// on first subscription, then never used again.
    backlog: Vec<Frame>,
    ever_subscribed: bool,
}

#[derive(Default)]
struct RoomState {
    members: HashMap<PeerId, Member>,
    next_subscription_id: u64,
    /// Deliver every routed frame twice, for at-least-once fault injection.
    duplicate_delivery: bool,
}

impl RoomState {
    fn deliver(&mut self, to: &PeerId, frame: Frame) -> Result<(), RelayError> {
        let copies = if self.duplicate_delivery { 2 } else { 1 };
        let member = self
            .members
            .get_mut(to)
            .ok_or_else(|| RelayError::UnknownPeer(to.clone()))?;
        if !member.ever_subscribed {
            for _ in 0..copies {
                member.backlog.push(frame.clone());
            }
            return Ok(());
        }
        member.subscribers.retain(|(_, tx)| {
            let mut alive = true;
            for _ in 0..copies {
                if tx.send(frame.clone()).is_err() {
                    alive = false;
                    break;
                }
            }
            alive
        });
        Ok(())
    }
}

/// In-memory relay room. Mirrors the production relay's behavior: joins are
/// announced to the members already present, and outbound call events are
/// rewritten into their inbound counterparts for the target peer.
#[derive(Clone, Default)]
pub struct LocalRelay {
    room: Arc<Mutex<RoomState>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every frame twice, simulating at-least-once redelivery.
    pub fn set_duplicate_delivery(&self, on: bool) {
        if let Ok(mut room) = self.room.lock() {
            room.duplicate_delivery = on;
        }
    }

    /// Join the room. Members already present are told about the newcomer;
    /// the newcomer learns of them only through their signaling.
    pub fn join(&self, peer: PeerId) -> RelayHandle {
        let mut room = self.room.lock().expect("relay room poisoned");
        let announce = Frame::new(
            "peer-joined",
            serde_json::json!({ "peerId": peer.as_str() }),
        );
        let existing: Vec<PeerId> = room
            .members
            .keys()
            .filter(|p| **p != peer)
            .cloned()
            .collect();
        for other in existing {
            let _ = room.deliver(&other, announce.clone());
        }
        room.members.entry(peer.clone()).or_default();
        tracing::debug!("{} joined relay room", peer);
        RelayHandle {
            peer,
            room: Arc::clone(&self.room),
        }
    }

    /// Push a synthetic `peer-joined` for `joined` to `to`. Lets tests and
    /// the simulation stage glare without racing real joins.
    pub fn announce(&self, to: &PeerId, joined: &PeerId) -> Result<(), RelayError> {
        let mut room = self.room.lock().expect("relay room poisoned");
        room.deliver(
            to,
            Frame::new(
                "peer-joined",
                serde_json::json!({ "peerId": joined.as_str() }),
            ),
        )
    }
}

/// A peer's connection to a [`LocalRelay`] room.
pub struct RelayHandle {
    peer: PeerId,
    room: Arc<Mutex<RoomState>>,
}

impl RelayHandle {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn target_of(payload: &Value) -> Option<PeerId> {
        payload
            .get("peerId")
            .and_then(Value::as_str)
            .map(PeerId::from)
    }
}

#[async_trait]
impl SignalingChannel for RelayHandle {
    /// Route an outbound frame to its target, rewritten the way the relay
    /// server presents it to the far side.
    async fn emit(&self, frame: Frame) -> Result<(), RelayError> {
        let target =
            Self::target_of(&frame.payload).ok_or_else(|| RelayError::Unroutable(frame.event.clone()))?;
        let from = self.peer.as_str();

        let inbound = match frame.event.as_str() {
            "call-user" => Frame::new(
                "incoming-offer",
                serde_json::json!({ "from": from, "offer": frame.payload.get("offer") }),
            ),
            "call-accepted" => Frame::new(
                "call-accepted",
                serde_json::json!({ "answer": frame.payload.get("answer") }),
            ),
            "ice-candidate" => Frame::new(
                "ice-candidate",
                serde_json::json!({ "from": from, "candidate": frame.payload.get("candidate") }),
            ),
            "call-ended" => Frame::new("call-ended", serde_json::json!({ "from": from })),
            other => return Err(RelayError::Unroutable(other.to_string())),
        };

        let mut room = self.room.lock().expect("relay room poisoned");
        room.deliver(&target, inbound)
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut room = self.room.lock().expect("relay room poisoned");
        let id = room.next_subscription_id;
        room.next_subscription_id += 1;
        let member = room.members.entry(self.peer.clone()).or_default();
        for frame in member.backlog.drain(..) {
            let _ = tx.send(frame);
        }
        member.ever_subscribed = true;
        member.subscribers.push((id, tx));
        Subscription {
            rx,
            _guard: SubscriptionGuard {
                room: Arc::clone(&self.room),
                peer: self.peer.clone(),
                id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_announces_to_existing_members_only() {
        let relay = LocalRelay::new();
        let alice = relay.join(PeerId::from("alice"));
        let mut alice_sub = alice.subscribe();

        let bob = relay.join(PeerId::from("bob"));
        let mut bob_sub = bob.subscribe();

        let frame = alice_sub.recv().await.unwrap();
        assert_eq!(frame.event, "peer-joined");
        assert_eq!(frame.payload["peerId"], "bob");

        // Bob subscribed after joining; he gets nothing about alice.
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(20),
            bob_sub.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_call_user_arrives_as_incoming_offer() {
        let relay = LocalRelay::new();
        let alice = relay.join(PeerId::from("alice"));
        let bob = relay.join(PeerId::from("bob"));
        let mut bob_sub = bob.subscribe();

        alice
            .emit(Frame::new(
                "call-user",
                serde_json::json!({ "peerId": "bob", "offer": { "type": "offer", "sdp": "v=0\r\n" } }),
            ))
            .await
            .unwrap();

        let frame = bob_sub.recv().await.unwrap();
        assert_eq!(frame.event, "incoming-offer");
        assert_eq!(frame.payload["from"], "alice");
        assert_eq!(frame.payload["offer"]["type"], "offer");
    }

    #[tokio::test]
    async fn test_dropped_subscription_detaches() {
        let relay = LocalRelay::new();
        let alice = relay.join(PeerId::from("alice"));
        let bob = relay.join(PeerId::from("bob"));

        let sub = bob.subscribe();
        drop(sub);

        // Emitting still succeeds; the frame just has nowhere to land.
        alice
            .emit(Frame::new(
                "call-ended",
                serde_json::json!({ "peerId": "bob" }),
            ))
            .await
            .unwrap();

        let mut sub2 = bob.subscribe();
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(20),
            sub2.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_mode() {
        let relay = LocalRelay::new();
        relay.set_duplicate_delivery(true);
        let alice = relay.join(PeerId::from("alice"));
        let bob = relay.join(PeerId::from("bob"));
        let mut bob_sub = bob.subscribe();

        alice
            .emit(Frame::new(
                "call-ended",
                serde_json::json!({ "peerId": "bob" }),
            ))
            .await
            .unwrap();

        assert_eq!(bob_sub.recv().await.unwrap().event, "call-ended");
        assert_eq!(bob_sub.recv().await.unwrap().event, "call-ended");
    }

    #[tokio::test]
    async fn test_frames_before_first_subscribe_are_replayed() {
        let relay = LocalRelay::new();
        let alice = relay.join(PeerId::from("alice"));
        let bob = relay.join(PeerId::from("bob"));

        // Bob has joined but not subscribed yet.
        alice
            .emit(Frame::new(
                "call-ended",
                serde_json::json!({ "peerId": "bob" }),
            ))
            .await
            .unwrap();

        let mut sub = bob.subscribe();
        assert_eq!(sub.recv().await.unwrap().event, "call-ended");
    }

    #[tokio::test]
    async fn test_emit_to_absent_peer_errors() {
        let relay = LocalRelay::new();
        let alice = relay.join(PeerId::from("alice"));
        let err = alice
            .emit(Frame::new(
                "call-ended",
                serde_json::json!({ "peerId": "ghost" }),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownPeer(_)));
    }
}
