//! Offer/answer bookkeeping for a single pair of peers.
//!
//! A [`NegotiationRecord`] decides, for every negotiation envelope exchanged
//! between two peers, whether it is forwarded now, held back, or dropped. It
//! never touches a transport: the caller receives a [`Verdict`] listing the
//! deliveries in the order they must be enqueued.
//!
//! A side counts as having its remote description once the SDP it depends on
//! (the offer for the responder, the answer for the initiator) has been
//! handed to its outbound queue. ICE candidates addressed to a side without a
//! remote description are buffered and released right after that SDP.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use serde::Serialize;

use crate::config::GlarePolicy;
use crate::envelope::{Envelope, EnvelopeKind, PeerId, PeerRole};
use crate::error::{SignalError, SignalResult};

/// Upper bound on candidates held for a pair. The oldest are dropped first.
pub const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerSent,
    Connected,
    Failed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Unordered pair of peers, stored with the smaller id first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: PeerId,
    high: PeerId,
}

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.low == peer_id || self.high == peer_id
    }

    pub fn other(&self, peer_id: &str) -> Option<&str> {
        if self.low == peer_id {
            Some(&self.high)
        } else if self.high == peer_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

/// An envelope bound for a specific peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: PeerId,
    pub envelope: Envelope,
}

impl Delivery {
    fn new(to: &str, envelope: Envelope) -> Self {
        Self {
            to: to.to_string(),
            envelope,
        }
    }
}

/// Outcome of feeding one envelope to a record.
#[derive(Debug, Default, PartialEq)]
pub struct Verdict {
    /// Envelopes to enqueue, in order.
    pub deliveries: Vec<Delivery>,
    /// The envelope was held back in the candidate buffer.
    pub buffered: bool,
    /// Buffered candidates evicted to make room.
    pub dropped: usize,
    /// The envelope was consumed by the relay and not forwarded.
    pub absorbed: bool,
    /// Simultaneous offers were detected and resolved.
    pub glare: bool,
    /// Role changes the registry should record.
    pub roles: Vec<(PeerId, PeerRole)>,
}

#[derive(Debug, Clone)]
struct PendingOffer {
    offerer: PeerId,
    handshake_id: Option<String>,
}

#[derive(Debug)]
pub struct NegotiationRecord {
    key: PairKey,
    state: NegotiationState,
    offer: Option<PendingOffer>,
    remote_ready: BTreeSet<PeerId>,
    connected: BTreeSet<PeerId>,
    pending_candidates: VecDeque<Delivery>,
}

impl NegotiationRecord {
    pub fn new(key: PairKey) -> Self {
        Self {
            key,
            state: NegotiationState::Idle,
            offer: None,
            remote_ready: BTreeSet::new(),
            connected: BTreeSet::new(),
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn key(&self) -> &PairKey {
        &self.key
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn initiator(&self) -> Option<&str> {
        self.offer.as_ref().map(|offer| offer.offerer.as_str())
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Feed an envelope travelling from its sender to `to`.
    pub fn apply(
        &mut self,
        envelope: &Envelope,
        to: &str,
        policy: GlarePolicy,
    ) -> SignalResult<Verdict> {
        let from = envelope.sender();
        if !self.key.contains(from) || self.key.other(from) != Some(to) {
            return Err(SignalError::UnknownPeer(to.to_string()));
        }
        if self.state == NegotiationState::Failed {
            return Err(SignalError::SessionNotFound(from.to_string()));
        }

        match envelope.kind() {
            EnvelopeKind::Offer => self.on_offer(envelope, to, policy),
            EnvelopeKind::Answer => self.on_answer(envelope, to),
            EnvelopeKind::IceCandidate => Ok(self.on_candidate(envelope, to)),
            EnvelopeKind::Connected => Ok(self.on_connected(from)),
            _ => Ok(Verdict {
                deliveries: vec![Delivery::new(to, envelope.clone())],
                ..Verdict::default()
            }),
        }
    }

    /// Terminal failure: a peer left or its transport closed. Returns the
    /// number of buffered candidates discarded.
    pub fn fail(&mut self) -> usize {
        self.state = NegotiationState::Failed;
        let dropped = self.pending_candidates.len();
        self.pending_candidates.clear();
        self.remote_ready.clear();
        self.connected.clear();
        dropped
    }

    fn on_offer(
        &mut self,
        envelope: &Envelope,
        to: &str,
        policy: GlarePolicy,
    ) -> SignalResult<Verdict> {
        let from = envelope.sender();
        let current = match (&self.state, &self.offer) {
            (NegotiationState::OfferSent, Some(offer)) => Some(offer.offerer.clone()),
            _ => None,
        };

        let Some(current) = current else {
            return Ok(self.start_offer(envelope, to));
        };

        if current == from {
            return Err(SignalError::OfferPending(from.to_string()));
        }

        if glare_winner(policy, &current, from) == current {
            // The standing offer keeps priority; the late one is dropped.
            return Ok(Verdict {
                deliveries: vec![Delivery::new(
                    from,
                    Envelope::role(from, PeerRole::Responder, &current),
                )],
                absorbed: true,
                glare: true,
                roles: vec![
                    (current.clone(), PeerRole::Initiator),
                    (from.to_string(), PeerRole::Responder),
                ],
                ..Verdict::default()
            });
        }

        // The incoming offer wins and replaces the standing one.
        let mut verdict = Verdict {
            deliveries: vec![Delivery::new(
                to,
                Envelope::role(to, PeerRole::Responder, from),
            )],
            glare: true,
            ..Verdict::default()
        };
        let started = self.start_offer(envelope, to);
        verdict.deliveries.extend(started.deliveries);
        verdict.roles = started.roles;
        verdict.deliveries.push(Delivery::new(
            from,
            Envelope::role(from, PeerRole::Initiator, to),
        ));
        Ok(verdict)
    }

    fn start_offer(&mut self, envelope: &Envelope, to: &str) -> Verdict {
        let from = envelope.sender();
        self.state = NegotiationState::OfferSent;
        self.offer = Some(PendingOffer {
            offerer: from.to_string(),
            handshake_id: envelope.handshake_id().map(str::to_string),
        });
        self.connected.clear();
        self.remote_ready.clear();
        self.remote_ready.insert(to.to_string());

        let mut deliveries = vec![Delivery::new(to, envelope.clone())];
        deliveries.extend(self.release_for(to));
        Verdict {
            deliveries,
            roles: vec![
                (from.to_string(), PeerRole::Initiator),
                (to.to_string(), PeerRole::Responder),
            ],
            ..Verdict::default()
        }
    }

    fn on_answer(&mut self, envelope: &Envelope, to: &str) -> SignalResult<Verdict> {
        let from = envelope.sender();
        let stale = || SignalError::StaleAnswer(from.to_string());

        if self.state != NegotiationState::OfferSent {
            return Err(stale());
        }
        let offer = self.offer.as_ref().ok_or_else(stale)?;
        if offer.offerer == from || offer.offerer != to {
            return Err(stale());
        }
        if let Some(answered) = envelope.handshake_id() {
            if offer.handshake_id.as_deref() != Some(answered) {
                return Err(stale());
            }
        }

        self.state = NegotiationState::AnswerSent;
        self.remote_ready.insert(to.to_string());

        let mut deliveries = vec![Delivery::new(to, envelope.clone())];
        deliveries.extend(self.release_for(to));
        Ok(Verdict {
            deliveries,
            ..Verdict::default()
        })
    }

    fn on_candidate(&mut self, envelope: &Envelope, to: &str) -> Verdict {
        let ready = match self.state {
            NegotiationState::Idle => false,
            NegotiationState::OfferSent => self.remote_ready.contains(to),
            NegotiationState::AnswerSent | NegotiationState::Connected => true,
            NegotiationState::Failed => false,
        };

        if ready {
            Verdict {
                deliveries: vec![Delivery::new(to, envelope.clone())],
                ..Verdict::default()
            }
        } else {
            let mut dropped = 0;
            while self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                self.pending_candidates.pop_front();
                dropped += 1;
            }
            self.pending_candidates
                .push_back(Delivery::new(to, envelope.clone()));
            Verdict {
                buffered: true,
                dropped,
                ..Verdict::default()
            }
        }
    }

    fn on_connected(&mut self, from: &str) -> Verdict {
        if matches!(
            self.state,
            NegotiationState::AnswerSent | NegotiationState::Connected
        ) {
            self.connected.insert(from.to_string());
            if self.connected.len() == 2 {
                self.state = NegotiationState::Connected;
            }
        }
        Verdict {
            absorbed: true,
            ..Verdict::default()
        }
    }

    fn release_for(&mut self, to: &str) -> Vec<Delivery> {
        let mut released = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending_candidates.len());
        for delivery in self.pending_candidates.drain(..) {
            if delivery.to == to {
                released.push(delivery);
            } else {
                kept.push_back(delivery);
            }
        }
        self.pending_candidates = kept;
        released
    }
}

pub fn glare_winner<'a>(policy: GlarePolicy, a: &'a str, b: &'a str) -> &'a str {
    match policy {
        GlarePolicy::LexicographicPeerId => {
            if a <= b {
                a
            } else {
                b
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const POLICY: GlarePolicy = GlarePolicy::LexicographicPeerId;

    fn record() -> NegotiationRecord {
        NegotiationRecord::new(PairKey::new("bob", "alice"))
    }

    fn candidate(from: &str, to: &str, n: u32) -> Envelope {
        Envelope::ice_candidate(
            from,
            Some(to.to_string()),
            json!({ "candidate": format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host") }),
        )
    }

    fn kinds(verdict: &Verdict) -> Vec<(String, EnvelopeKind)> {
        verdict
            .deliveries
            .iter()
            .map(|d| (d.to.clone(), d.envelope.kind()))
            .collect()
    }

    #[test_timeout::timeout]
    fn pair_key_is_unordered() {
        let key = PairKey::new("bob", "alice");
        assert_eq!(key, PairKey::new("alice", "bob"));
        assert_eq!(key.other("alice"), Some("bob"));
        assert_eq!(key.other("carol"), None);
    }

    #[test_timeout::timeout]
    fn offer_answer_candidates_connected() {
        let mut rec = record();
        let offer = Envelope::offer("alice", Some("bob".into()), "v=0");
        let verdict = rec.apply(&offer, "bob", POLICY).unwrap();
        assert_eq!(verdict.deliveries, vec![Delivery::new("bob", offer)]);
        assert_eq!(rec.state(), NegotiationState::OfferSent);
        assert_eq!(rec.initiator(), Some("alice"));
        assert!(verdict
            .roles
            .contains(&("bob".to_string(), PeerRole::Responder)));

        let answer = Envelope::answer("bob", Some("alice".into()), "v=0");
        let verdict = rec.apply(&answer, "alice", POLICY).unwrap();
        assert_eq!(kinds(&verdict), vec![("alice".into(), EnvelopeKind::Answer)]);
        assert_eq!(rec.state(), NegotiationState::AnswerSent);

        for (from, to) in [("alice", "bob"), ("bob", "alice")] {
            let verdict = rec.apply(&candidate(from, to, 1), to, POLICY).unwrap();
            assert!(!verdict.buffered);
            assert_eq!(verdict.deliveries.len(), 1);
        }

        let verdict = rec
            .apply(&Envelope::connected("alice", Some("bob".into())), "bob", POLICY)
            .unwrap();
        assert!(verdict.absorbed && verdict.deliveries.is_empty());
        assert_eq!(rec.state(), NegotiationState::AnswerSent);
        rec.apply(&Envelope::connected("bob", Some("alice".into())), "alice", POLICY)
            .unwrap();
        assert_eq!(rec.state(), NegotiationState::Connected);
    }

    #[test_timeout::timeout]
    fn responder_candidates_wait_for_answer() {
        let mut rec = record();
        rec.apply(&Envelope::offer("alice", Some("bob".into()), "v=0"), "bob", POLICY)
            .unwrap();

        // Initiator's candidates can go straight to the responder.
        let verdict = rec.apply(&candidate("alice", "bob", 1), "bob", POLICY).unwrap();
        assert_eq!(verdict.deliveries.len(), 1);

        // Responder's candidates are held until the initiator has the answer.
        for n in 1..=3 {
            let verdict = rec.apply(&candidate("bob", "alice", n), "alice", POLICY).unwrap();
            assert!(verdict.buffered);
        }
        assert_eq!(rec.pending_candidates(), 3);

        let answer = Envelope::answer("bob", Some("alice".into()), "v=0");
        let verdict = rec.apply(&answer, "alice", POLICY).unwrap();
        assert_eq!(verdict.deliveries[0].envelope, answer);
        let released: Vec<_> = verdict.deliveries[1..]
            .iter()
            .map(|d| d.envelope.clone())
            .collect();
        assert_eq!(
            released,
            vec![
                candidate("bob", "alice", 1),
                candidate("bob", "alice", 2),
                candidate("bob", "alice", 3)
            ]
        );
        assert_eq!(rec.pending_candidates(), 0);
    }

    #[test_timeout::timeout]
    fn candidates_before_offer_follow_it() {
        let mut rec = record();
        let early = candidate("alice", "bob", 7);
        assert!(rec.apply(&early, "bob", POLICY).unwrap().buffered);

        let offer = Envelope::offer("alice", Some("bob".into()), "v=0");
        let verdict = rec.apply(&offer, "bob", POLICY).unwrap();
        assert_eq!(
            verdict.deliveries,
            vec![Delivery::new("bob", offer), Delivery::new("bob", early)]
        );
    }

    #[test_timeout::timeout]
    fn idle_buffer_is_bounded_and_keeps_newest() {
        let mut rec = record();
        let total = MAX_PENDING_CANDIDATES as u32 + 5;
        let mut dropped = 0;
        for n in 0..total {
            let verdict = rec.apply(&candidate("alice", "bob", n), "bob", POLICY).unwrap();
            assert!(verdict.buffered);
            dropped += verdict.dropped;
        }
        assert_eq!(dropped, 5);
        assert_eq!(rec.pending_candidates(), MAX_PENDING_CANDIDATES);

        let offer = Envelope::offer("alice", Some("bob".into()), "v=0");
        let verdict = rec.apply(&offer, "bob", POLICY).unwrap();
        assert_eq!(verdict.deliveries.len(), MAX_PENDING_CANDIDATES + 1);
        assert_eq!(verdict.deliveries[1].envelope, candidate("alice", "bob", 5));
        assert_eq!(
            verdict.deliveries.last().map(|d| d.envelope.clone()),
            Some(candidate("alice", "bob", total - 1))
        );
    }

    #[test_timeout::timeout]
    fn repeated_offer_from_same_peer_is_rejected() {
        let mut rec = record();
        let offer = Envelope::offer("bob", Some("alice".into()), "v=0");
        rec.apply(&offer, "alice", POLICY).unwrap();
        assert_eq!(
            rec.apply(&offer, "alice", POLICY).unwrap_err(),
            SignalError::OfferPending("bob".into())
        );
    }

    #[test_timeout::timeout]
    fn glare_late_larger_offer_is_dropped() {
        let mut rec = record();
        rec.apply(&Envelope::offer("alice", Some("bob".into()), "a"), "bob", POLICY)
            .unwrap();
        let verdict = rec
            .apply(&Envelope::offer("bob", Some("alice".into()), "b"), "alice", POLICY)
            .unwrap();
        assert!(verdict.glare && verdict.absorbed);
        assert_eq!(kinds(&verdict), vec![("bob".into(), EnvelopeKind::Role)]);
        assert_eq!(verdict.deliveries[0].envelope.payload()["role"], "responder");
        assert_eq!(rec.initiator(), Some("alice"));
    }

    #[test_timeout::timeout]
    fn glare_late_smaller_offer_takes_over() {
        let mut rec = record();
        rec.apply(&Envelope::offer("bob", Some("alice".into()), "b"), "alice", POLICY)
            .unwrap();
        let held = candidate("alice", "bob", 2);
        assert!(rec.apply(&held, "bob", POLICY).unwrap().buffered);

        let offer = Envelope::offer("alice", Some("bob".into()), "a");
        let verdict = rec.apply(&offer, "bob", POLICY).unwrap();
        assert!(verdict.glare && !verdict.absorbed);
        assert_eq!(
            kinds(&verdict),
            vec![
                ("bob".into(), EnvelopeKind::Role),
                ("bob".into(), EnvelopeKind::Offer),
                ("bob".into(), EnvelopeKind::IceCandidate),
                ("alice".into(), EnvelopeKind::Role),
            ]
        );
        assert_eq!(verdict.deliveries[2].envelope, held);
        assert_eq!(rec.pending_candidates(), 0);
        assert_eq!(rec.initiator(), Some("alice"));

        // The superseded offer can no longer be answered.
        let err = rec
            .apply(&Envelope::answer("alice", Some("bob".into()), "x"), "bob", POLICY)
            .unwrap_err();
        assert_eq!(err, SignalError::StaleAnswer("alice".into()));
    }

    #[test_timeout::timeout]
    fn answers_without_matching_offer_are_stale() {
        let mut rec = record();
        let answer = Envelope::answer("bob", Some("alice".into()), "v=0");
        assert!(matches!(
            rec.apply(&answer, "alice", POLICY),
            Err(SignalError::StaleAnswer(_))
        ));

        let offer = Envelope::new(
            EnvelopeKind::Offer,
            "alice",
            Some("bob".into()),
            json!({ "type": "offer", "sdp": "v=0", "handshakeId": "h1" }),
        );
        rec.apply(&offer, "bob", POLICY).unwrap();
        let wrong = Envelope::new(
            EnvelopeKind::Answer,
            "bob",
            Some("alice".into()),
            json!({ "type": "answer", "sdp": "v=0", "handshakeId": "h0" }),
        );
        assert!(matches!(
            rec.apply(&wrong, "alice", POLICY),
            Err(SignalError::StaleAnswer(_))
        ));
        assert_eq!(rec.state(), NegotiationState::OfferSent);

        let right = Envelope::new(
            EnvelopeKind::Answer,
            "bob",
            Some("alice".into()),
            json!({ "type": "answer", "sdp": "v=0", "handshakeId": "h1" }),
        );
        rec.apply(&right, "alice", POLICY).unwrap();
        assert!(matches!(
            rec.apply(&right, "alice", POLICY),
            Err(SignalError::StaleAnswer(_))
        ));
    }

    #[test_timeout::timeout]
    fn failure_discards_buffer_and_rejects_traffic() {
        let mut rec = record();
        rec.apply(&candidate("alice", "bob", 1), "bob", POLICY).unwrap();
        rec.apply(&candidate("bob", "alice", 2), "alice", POLICY).unwrap();
        assert_eq!(rec.fail(), 2);
        assert_eq!(rec.state(), NegotiationState::Failed);
        assert!(matches!(
            rec.apply(&candidate("alice", "bob", 3), "bob", POLICY),
            Err(SignalError::SessionNotFound(_))
        ));
    }

    #[test_timeout::timeout]
    fn renegotiation_after_connected_restarts_offer() {
        let mut rec = record();
        rec.apply(&Envelope::offer("alice", Some("bob".into()), "1"), "bob", POLICY)
            .unwrap();
        rec.apply(&Envelope::answer("bob", Some("alice".into()), "1"), "alice", POLICY)
            .unwrap();
        rec.apply(&Envelope::connected("alice", None), "bob", POLICY).unwrap();
        rec.apply(&Envelope::connected("bob", None), "alice", POLICY).unwrap();
        assert_eq!(rec.state(), NegotiationState::Connected);

        let verdict = rec
            .apply(&Envelope::offer("bob", Some("alice".into()), "2"), "alice", POLICY)
            .unwrap();
        assert_eq!(kinds(&verdict), vec![("alice".into(), EnvelopeKind::Offer)]);
        assert_eq!(rec.state(), NegotiationState::OfferSent);
        assert_eq!(rec.initiator(), Some("bob"));
    }

    #[test_timeout::timeout]
    fn glare_winner_is_lexicographic() {
        assert_eq!(glare_winner(POLICY, "b", "a"), "a");
        assert_eq!(glare_winner(POLICY, "a", "b"), "a");
    }
}
