//! Signaling relay core: peers join a session, exchange SDP offers/answers
//! and trickle ICE candidates through the relay, which orders them and
//! resolves simultaneous offers deterministically.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod negotiation;
pub mod registry;
pub mod router;

pub use codec::{decode, encode, encode_to_string, DecodeError, EncodeError};
pub use config::{GlarePolicy, RelayConfig};
pub use envelope::{Envelope, EnvelopeKind, PeerId, PeerRole, SessionId, RELAY_SENDER};
pub use error::{SignalError, SignalResult};
pub use negotiation::{NegotiationRecord, NegotiationState, PairKey, MAX_PENDING_CANDIDATES};
pub use registry::{Departure, PeerHandle, PeerSnapshot, SessionRegistry, SessionSnapshot};
pub use router::{RelayRouter, RouteOutcome};
