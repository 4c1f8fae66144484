//! JSON wire format for signaling envelopes.
//!
//! ```text
//! { "type": "offer" | "answer" | "ice-candidate" | "join" | "leave" | ...,
//!   "from": string, "to": string | null, "payload": { ... } }
//! ```
//!
//! Decoding fails closed: an unknown `type` or an offer/answer payload without
//! string `type` and `sdp` fields is rejected outright. SDP bodies are never
//! parsed beyond that.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    InvalidJson(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown envelope type `{0}`")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        kind: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    payload: Value,
}

pub fn encode(envelope: &Envelope) -> Result<Bytes, EncodeError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Text form for transports that carry UTF-8 frames.
pub fn encode_to_string(envelope: &Envelope) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;

    let kind_str = wire.kind.ok_or(DecodeError::MissingField("type"))?;
    let kind = EnvelopeKind::parse(&kind_str).ok_or(DecodeError::UnknownType(kind_str))?;

    let from = wire
        .from
        .filter(|from| !from.is_empty())
        .ok_or(DecodeError::MissingField("from"))?;

    if kind.carries_sdp() {
        validate_description(kind, &wire.payload)?;
    }

    Ok(Envelope::new(kind, from, wire.to, wire.payload))
}

fn validate_description(kind: EnvelopeKind, payload: &Value) -> Result<(), DecodeError> {
    let invalid = |reason| DecodeError::InvalidPayload {
        kind: kind.as_str(),
        reason,
    };
    let object = payload
        .as_object()
        .ok_or_else(|| invalid("payload must be an object"))?;
    match object.get("type") {
        Some(Value::String(_)) => {}
        _ => return Err(invalid("`type` must be a string")),
    }
    match object.get("sdp") {
        Some(Value::String(_)) => {}
        _ => return Err(invalid("`sdp` must be a string")),
    }
    Ok(())
}
