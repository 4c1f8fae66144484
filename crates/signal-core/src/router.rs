use metrics::counter;
use tracing::{debug, warn};

use crate::codec;
use crate::envelope::{Envelope, EnvelopeKind, PeerId};
use crate::error::{SignalError, SignalResult};
use crate::negotiation::PairKey;
use crate::registry::{Session, SessionRegistry, LEAVE_REQUESTED};

/// What happened to a routed envelope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Peers the envelope itself was enqueued for.
    pub forwarded: Vec<PeerId>,
    /// Destinations for which the envelope was held in a candidate buffer.
    pub buffered: usize,
    /// Extra envelopes enqueued alongside it (released candidates, role notices).
    pub released: usize,
    /// The relay consumed the envelope instead of forwarding it.
    pub absorbed: bool,
    /// Broadcast destinations whose negotiation guard refused the envelope.
    pub rejected: Vec<(PeerId, SignalError)>,
}

impl RouteOutcome {
    /// Whether at least one destination took the envelope.
    pub fn accepted(&self) -> bool {
        !self.forwarded.is_empty() || self.buffered > 0 || self.released > 0 || self.absorbed
    }
}

/// Resolves destinations, applies the negotiation guard and enqueues
/// envelopes on the destination peers' outbound queues. Never waits for
/// delivery.
#[derive(Clone)]
pub struct RelayRouter {
    registry: SessionRegistry,
}

impl RelayRouter {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn route(&self, envelope: &Envelope) -> SignalResult<RouteOutcome> {
        let sender = envelope.sender();
        let session = self
            .registry
            .session_for_peer(sender)
            .ok_or_else(|| SignalError::SessionNotFound(sender.to_string()))?;
        session.touch();

        let destinations = match envelope.recipient() {
            Some(to) => {
                if to == sender || !session.contains(to) {
                    return Err(SignalError::UnknownPeer(to.to_string()));
                }
                vec![to.to_string()]
            }
            None => session.members_except(sender),
        };

        let broadcast = envelope.recipient().is_none();
        let mut outcome = RouteOutcome::default();
        for to in destinations {
            if envelope.kind().is_negotiation() {
                match self.negotiate(&session, envelope, &to, &mut outcome) {
                    Ok(()) => {}
                    Err(err) if broadcast => {
                        debug!(to = %to, error = %err, "broadcast destination rejected");
                        outcome.rejected.push((to, err));
                    }
                    Err(err) => return Err(err),
                }
            } else if session.deliver(&to, envelope.clone()).is_ok() {
                outcome.forwarded.push(to);
            }
        }

        // A broadcast fails only when every destination turned it down.
        if !outcome.accepted() {
            if let Some((_, err)) = outcome.rejected.first() {
                return Err(err.clone());
            }
        }
        for (_, err) in &outcome.rejected {
            counter!("signal_route_errors_total", 1, "code" => err.code());
        }

        if !outcome.forwarded.is_empty() {
            counter!(
                "signal_envelopes_routed_total",
                outcome.forwarded.len() as u64,
                "type" => envelope.kind().as_str()
            );
        }
        Ok(outcome)
    }

    fn negotiate(
        &self,
        session: &Session,
        envelope: &Envelope,
        to: &str,
        outcome: &mut RouteOutcome,
    ) -> SignalResult<()> {
        let sender = envelope.sender();
        let key = PairKey::new(sender, to);
        let record = session.record(&key);

        // Deliveries are enqueued while the record lock is held so a
        // concurrent candidate can never overtake the SDP it depends on.
        let mut guard = record.lock();
        if !session.contains(sender) || !session.contains(to) {
            guard.fail();
            drop(guard);
            session.discard_record(&key, &record);
            warn!(
                session_id = %session.id(),
                from = %sender,
                to = %to,
                "discarding negotiation for departed peer"
            );
            return Err(SignalError::SessionNotFound(sender.to_string()));
        }

        let policy = self.registry.config().glare_policy;
        let verdict = match guard.apply(envelope, to, policy) {
            Ok(verdict) => verdict,
            Err(SignalError::SessionNotFound(peer)) => {
                drop(guard);
                session.discard_record(&key, &record);
                return Err(SignalError::SessionNotFound(peer));
            }
            Err(err) => return Err(err),
        };

        for (peer_id, role) in &verdict.roles {
            session.set_role(peer_id, *role);
        }

        let mut original_pending = !verdict.buffered && !verdict.absorbed;
        for delivery in verdict.deliveries {
            let is_original =
                original_pending && delivery.to == to && delivery.envelope == *envelope;
            if let Err(err) = session.deliver(&delivery.to, delivery.envelope) {
                debug!(to = %delivery.to, error = %err, "delivery skipped");
                continue;
            }
            if is_original {
                original_pending = false;
                outcome.forwarded.push(to.to_string());
            } else {
                outcome.released += 1;
            }
        }
        let state = guard.state();
        drop(guard);

        if verdict.buffered {
            outcome.buffered += 1;
            counter!("signal_candidates_buffered_total", 1);
        }
        if verdict.dropped > 0 {
            counter!("signal_candidates_dropped_total", verdict.dropped as u64);
            warn!(
                session_id = %session.id(),
                from = %sender,
                to = %to,
                dropped = verdict.dropped,
                "candidate buffer full"
            );
        }
        if verdict.absorbed {
            outcome.absorbed = true;
        }
        if verdict.glare {
            counter!("signal_glare_resolved_total", 1);
            debug!(
                session_id = %session.id(),
                from = %sender,
                to = %to,
                "glare resolved"
            );
        }
        debug!(
            session_id = %session.id(),
            kind = envelope.kind().as_str(),
            from = %sender,
            to = %to,
            state = %state,
            "negotiation advanced"
        );
        Ok(())
    }

    /// Inbound hook for a peer's read loop. Structural failures are reported
    /// back to the peer as `error` envelopes and returned for logging.
    pub fn on_envelope(&self, peer_id: &str, envelope: Envelope) -> SignalResult<RouteOutcome> {
        let result = self.dispatch(peer_id, &envelope);
        if let Err(err) = &result {
            self.report(peer_id, err);
        }
        result
    }

    /// Decodes a raw frame and hands it to [`RelayRouter::on_envelope`].
    pub fn on_message(&self, peer_id: &str, bytes: &[u8]) -> SignalResult<RouteOutcome> {
        match codec::decode(bytes) {
            Ok(envelope) => self.on_envelope(peer_id, envelope),
            Err(err) => {
                let err = SignalError::from(err);
                self.report(peer_id, &err);
                Err(err)
            }
        }
    }

    /// Outbound call: enqueue an envelope for a registered peer.
    pub fn send(&self, peer_id: &str, envelope: Envelope) -> SignalResult<()> {
        let session = self
            .registry
            .session_for_peer(peer_id)
            .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;
        session.deliver(peer_id, envelope)
    }

    fn dispatch(&self, peer_id: &str, envelope: &Envelope) -> SignalResult<RouteOutcome> {
        if envelope.sender() != peer_id {
            return Err(SignalError::SenderMismatch {
                claimed: envelope.sender().to_string(),
                actual: peer_id.to_string(),
            });
        }

        if envelope.kind() == EnvelopeKind::Leave {
            self.registry
                .unregister_with_reason(peer_id, LEAVE_REQUESTED)
                .ok_or_else(|| SignalError::SessionNotFound(peer_id.to_string()))?;
            return Ok(RouteOutcome {
                absorbed: true,
                ..RouteOutcome::default()
            });
        }

        self.route(envelope)
    }

    fn report(&self, peer_id: &str, err: &SignalError) {
        counter!("signal_route_errors_total", 1, "code" => err.code());
        if !err.is_reportable() {
            return;
        }
        debug!(peer_id = %peer_id, error = %err, "reporting error to peer");
        if let Err(send_err) = self.send(peer_id, Envelope::error(peer_id, err)) {
            debug!(peer_id = %peer_id, error = %send_err, "error report not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::registry::PeerHandle;
    use serde_json::json;

    fn setup(cap: usize) -> RelayRouter {
        RelayRouter::new(SessionRegistry::new(
            RelayConfig::default().with_member_cap(cap),
        ))
    }

    fn drain(handle: &mut PeerHandle) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = handle.outbound.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[test_timeout::timeout]
    fn unknown_recipient_is_reported() {
        let router = setup(2);
        let mut a = router.registry().register("room1", "a").unwrap();
        let mut b = router.registry().register("room1", "b").unwrap();
        drain(&mut a);
        drain(&mut b);

        let offer = Envelope::offer("a", Some("zed".into()), "v=0");
        let err = router.on_envelope("a", offer).unwrap_err();
        assert_eq!(err, SignalError::UnknownPeer("zed".into()));

        let reported = drain(&mut a);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind(), EnvelopeKind::Error);
        assert_eq!(reported[0].payload()["code"], "unknown-peer");
        assert!(drain(&mut b).is_empty());
    }

    #[test_timeout::timeout]
    fn sending_to_self_is_unknown_peer() {
        let router = setup(2);
        let _a = router.registry().register("room1", "a").unwrap();
        let offer = Envelope::offer("a", Some("a".into()), "v=0");
        assert!(matches!(
            router.route(&offer),
            Err(SignalError::UnknownPeer(_))
        ));
    }

    #[test_timeout::timeout]
    fn spoofed_sender_is_rejected() {
        let router = setup(2);
        let mut a = router.registry().register("room1", "a").unwrap();
        let mut b = router.registry().register("room1", "b").unwrap();
        drain(&mut a);
        drain(&mut b);

        let forged = Envelope::offer("b", Some("a".into()), "v=0");
        assert!(matches!(
            router.on_envelope("a", forged),
            Err(SignalError::SenderMismatch { .. })
        ));
        assert_eq!(drain(&mut a)[0].payload()["code"], "sender-mismatch");
        assert!(drain(&mut b).is_empty());
    }

    #[test_timeout::timeout]
    fn undecodable_frames_are_reported() {
        let router = setup(2);
        let mut a = router.registry().register("room1", "a").unwrap();
        drain(&mut a);

        let err = router
            .on_message("a", br#"{"type":"hangup","from":"a"}"#)
            .unwrap_err();
        assert!(matches!(err, SignalError::Decode(_)));
        let reported = drain(&mut a);
        assert_eq!(reported[0].payload()["code"], "decode-error");
    }

    #[test_timeout::timeout]
    fn join_envelopes_bypass_negotiation() {
        let router = setup(3);
        let mut a = router.registry().register("room1", "a").unwrap();
        let mut b = router.registry().register("room1", "b").unwrap();
        let mut c = router.registry().register("room1", "c").unwrap();
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        let hello = Envelope::new(EnvelopeKind::Join, "a", None, json!({ "label": "tab" }));
        let outcome = router.route(&hello).unwrap();
        assert_eq!(outcome.forwarded, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(drain(&mut b), vec![hello.clone()]);
        assert_eq!(drain(&mut c), vec![hello]);
        assert_eq!(router.registry().negotiation_state("a", "b"), None);
    }

    #[test_timeout::timeout]
    fn client_leave_unregisters_sender() {
        let router = setup(2);
        let mut a = router.registry().register("room1", "a").unwrap();
        let mut b = router.registry().register("room1", "b").unwrap();
        drain(&mut a);
        drain(&mut b);

        let leave = Envelope::new(EnvelopeKind::Leave, "a", None, json!({}));
        let outcome = router.on_envelope("a", leave).unwrap();
        assert!(outcome.absorbed);
        assert_eq!(router.registry().session_of("a"), None);

        let seen = drain(&mut b);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload()["reason"], LEAVE_REQUESTED);
    }

    #[test_timeout::timeout]
    fn send_reports_closed_transport() {
        let router = setup(2);
        let a = router.registry().register("room1", "a").unwrap();
        drop(a);
        assert_eq!(
            router.send("a", Envelope::connected("relay", None)),
            Err(SignalError::TransportClosed("a".into()))
        );
        assert_eq!(
            router.send("ghost", Envelope::connected("relay", None)),
            Err(SignalError::UnknownPeer("ghost".into()))
        );
    }

    #[test_timeout::timeout]
    fn candidates_are_buffered_per_destination() {
        let router = setup(2);
        let mut a = router.registry().register("room1", "a").unwrap();
        let mut b = router.registry().register("room1", "b").unwrap();
        drain(&mut a);
        drain(&mut b);

        let early = Envelope::ice_candidate("b", None, json!({ "candidate": "c1" }));
        let outcome = router.route(&early).unwrap();
        assert_eq!(outcome.buffered, 1);
        assert!(outcome.forwarded.is_empty());
        assert!(drain(&mut a).is_empty());

        router
            .route(&Envelope::offer("a", Some("b".into()), "v=0"))
            .unwrap();
        let outcome = router
            .route(&Envelope::answer("b", Some("a".into()), "v=0"))
            .unwrap();
        assert_eq!(outcome.forwarded, vec!["a".to_string()]);
        assert_eq!(outcome.released, 1);

        let kinds: Vec<_> = drain(&mut a).iter().map(Envelope::kind).collect();
        assert_eq!(kinds, vec![EnvelopeKind::Answer, EnvelopeKind::IceCandidate]);
    }
}
