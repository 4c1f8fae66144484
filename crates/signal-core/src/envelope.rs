use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SignalError;

/// Opaque peer identifier. The listener assigns UUID v4 strings.
pub type PeerId = String;

/// Session (room) identifier, supplied by the connecting client.
pub type SessionId = String;

/// Sender used on envelopes the relay itself originates.
pub const RELAY_SENDER: &str = "relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    Join,
    Leave,
    Error,
    Connected,
    Role,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice-candidate",
            EnvelopeKind::Join => "join",
            EnvelopeKind::Leave => "leave",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Connected => "connected",
            EnvelopeKind::Role => "role",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "offer" => EnvelopeKind::Offer,
            "answer" => EnvelopeKind::Answer,
            "ice-candidate" => EnvelopeKind::IceCandidate,
            "join" => EnvelopeKind::Join,
            "leave" => EnvelopeKind::Leave,
            "error" => EnvelopeKind::Error,
            "connected" => EnvelopeKind::Connected,
            "role" => EnvelopeKind::Role,
            _ => return None,
        })
    }

    /// Kinds that pass through the negotiation guard before forwarding.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::Offer
                | EnvelopeKind::Answer
                | EnvelopeKind::IceCandidate
                | EnvelopeKind::Connected
        )
    }

    /// Kinds whose payload must carry an SDP description.
    pub fn carries_sdp(&self) -> bool {
        matches!(self, EnvelopeKind::Offer | EnvelopeKind::Answer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Initiator,
    Responder,
    Unassigned,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Initiator => "initiator",
            PeerRole::Responder => "responder",
            PeerRole::Unassigned => "unassigned",
        }
    }
}

/// A signaling message in transit. Fields are read-only once built; the
/// relay routes envelopes but never rewrites them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    from: PeerId,
    to: Option<PeerId>,
    payload: Value,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        from: impl Into<PeerId>,
        to: Option<PeerId>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            from: from.into(),
            to,
            payload,
        }
    }

    pub fn offer(from: impl Into<PeerId>, to: Option<PeerId>, sdp: &str) -> Self {
        Self::new(
            EnvelopeKind::Offer,
            from,
            to,
            json!({ "type": "offer", "sdp": sdp }),
        )
    }

    pub fn answer(from: impl Into<PeerId>, to: Option<PeerId>, sdp: &str) -> Self {
        Self::new(
            EnvelopeKind::Answer,
            from,
            to,
            json!({ "type": "answer", "sdp": sdp }),
        )
    }

    pub fn ice_candidate(from: impl Into<PeerId>, to: Option<PeerId>, candidate: Value) -> Self {
        Self::new(EnvelopeKind::IceCandidate, from, to, candidate)
    }

    pub fn connected(from: impl Into<PeerId>, to: Option<PeerId>) -> Self {
        Self::new(EnvelopeKind::Connected, from, to, json!({}))
    }

    pub fn join(session_id: &str, peer_id: &str, peers: &[PeerId]) -> Self {
        Self::new(
            EnvelopeKind::Join,
            peer_id,
            None,
            json!({ "sessionId": session_id, "peerId": peer_id, "peers": peers }),
        )
    }

    pub fn leave(session_id: &str, peer_id: &str, reason: &str) -> Self {
        Self::new(
            EnvelopeKind::Leave,
            peer_id,
            None,
            json!({ "sessionId": session_id, "peerId": peer_id, "reason": reason }),
        )
    }

    pub fn error(to: &str, error: &SignalError) -> Self {
        Self::new(
            EnvelopeKind::Error,
            RELAY_SENDER,
            Some(to.to_string()),
            json!({ "code": error.code(), "message": error.to_string() }),
        )
    }

    pub fn role(to: &str, role: PeerRole, counterpart: &str) -> Self {
        Self::new(
            EnvelopeKind::Role,
            RELAY_SENDER,
            Some(to.to_string()),
            json!({ "role": role.as_str(), "peerId": counterpart }),
        )
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.from
    }

    pub fn recipient(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Client-chosen token tying an answer to the offer it responds to.
    pub fn handshake_id(&self) -> Option<&str> {
        self.payload.get("handshakeId").and_then(Value::as_str)
    }
}
