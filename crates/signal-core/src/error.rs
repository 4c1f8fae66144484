use thiserror::Error;

use crate::codec::DecodeError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(String),
    #[error("peer id must not be empty (session {0})")]
    InvalidPeerId(String),
    #[error("session {session_id} is full ({cap} members)")]
    SessionFull { session_id: String, cap: usize },
    #[error("session not found for peer {0}")]
    SessionNotFound(String),
    #[error("peer {0} is not a member of this session")]
    UnknownPeer(String),
    #[error("answer from {0} does not match a pending offer")]
    StaleAnswer(String),
    #[error("peer {0} already has an offer awaiting an answer")]
    OfferPending(String),
    #[error("envelope claims sender {claimed} on the connection of {actual}")]
    SenderMismatch { claimed: String, actual: String },
    #[error("invalid envelope: {0}")]
    Decode(#[from] DecodeError),
    #[error("transport closed for peer {0}")]
    TransportClosed(String),
}

impl SignalError {
    /// Stable identifier carried in `error` envelopes and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::DuplicatePeer(_) => "duplicate-peer",
            SignalError::InvalidPeerId(_) => "invalid-peer-id",
            SignalError::SessionFull { .. } => "session-full",
            SignalError::SessionNotFound(_) => "session-not-found",
            SignalError::UnknownPeer(_) => "unknown-peer",
            SignalError::StaleAnswer(_) => "stale-answer",
            SignalError::OfferPending(_) => "offer-pending",
            SignalError::SenderMismatch { .. } => "sender-mismatch",
            SignalError::Decode(_) => "decode-error",
            SignalError::TransportClosed(_) => "transport-closed",
        }
    }

    /// Errors the originating peer is told about. Everything else is a
    /// lifecycle signal handled by the listener.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, SignalError::TransportClosed(_))
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
