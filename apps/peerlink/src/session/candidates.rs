//! Candidate exchange, decoupled from description timing.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::signaling::{PeerId, SignalKind, SignalingMessage};
use crate::transport::{CandidateEvent, ConnectivityCandidate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied(ConnectivityCandidate),
    Duplicate,
    Skipped {
        candidate: ConnectivityCandidate,
        reason: String,
    },
    EndOfCandidates,
}

#[derive(Debug, Default)]
pub struct CandidateCoordinator {
    remote_ufrag: Option<String>,
    pending: VecDeque<CandidateEvent>,
    seen: HashSet<CandidateEvent>,
    applied: Vec<ConnectivityCandidate>,
    remote_complete: bool,
    local_forwarded: usize,
    local_complete: bool,
}

impl CandidateCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything from the previous round.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn applied(&self) -> &[ConnectivityCandidate] {
        &self.applied
    }

    pub fn remote_complete(&self) -> bool {
        self.remote_complete
    }

    pub fn local_forwarded(&self) -> usize {
        self.local_forwarded
    }

    pub fn local_complete(&self) -> bool {
        self.local_complete
    }

    /// Wraps a locally gathered candidate (or the end marker) for the peer.
    pub fn on_local(&mut self, from: &PeerId, event: &CandidateEvent) -> Result<SignalingMessage, SessionError> {
        let message = match event {
            CandidateEvent::Candidate(candidate) => {
                let payload = serde_json::to_vec(candidate)
                    .map_err(|err| SessionError::InvalidState(err.to_string()))?;
                self.local_forwarded += 1;
                SignalingMessage::new(from.clone(), SignalKind::Candidate, payload)
            }
            CandidateEvent::EndOfCandidates => {
                self.local_complete = true;
                SignalingMessage::new(from.clone(), SignalKind::EndOfCandidates, Bytes::new())
            }
        };
        Ok(message)
    }

    /// Idempotent. Without a remote description the candidate is queued and
    /// the caller gets [`SessionError::PrematureCandidate`].
    pub fn add_remote(&mut self, event: CandidateEvent) -> Result<CandidateOutcome, SessionError> {
        let fresh = self.seen.insert(event.clone());
        if self.remote_ufrag.is_none() {
            if fresh {
                self.pending.push_back(event);
            }
            debug!(
                target = "peerlink::candidates",
                queued = self.pending.len(),
                "candidate arrived before remote description"
            );
            return Err(SessionError::PrematureCandidate {
                queued: self.pending.len(),
            });
        }
        if !fresh {
            return Ok(CandidateOutcome::Duplicate);
        }
        Ok(self.apply(event))
    }

    /// Records the remote credentials and replays queued candidates in
    /// arrival order. The queue is drained, so each replays exactly once.
    pub fn set_remote(&mut self, ufrag: &str) -> Vec<CandidateOutcome> {
        self.remote_ufrag = Some(ufrag.to_string());
        let queued: Vec<CandidateEvent> = self.pending.drain(..).collect();
        if !queued.is_empty() {
            debug!(
                target = "peerlink::candidates",
                count = queued.len(),
                "flushing queued candidates"
            );
        }
        queued.into_iter().map(|event| self.apply(event)).collect()
    }

    fn apply(&mut self, event: CandidateEvent) -> CandidateOutcome {
        let candidate = match event {
            CandidateEvent::EndOfCandidates => {
                self.remote_complete = true;
                return CandidateOutcome::EndOfCandidates;
            }
            CandidateEvent::Candidate(candidate) => candidate,
        };
        let reason = if Some(candidate.ufrag.as_str()) != self.remote_ufrag.as_deref() {
            Some("credential mismatch")
        } else if !is_parsable(&candidate.address) {
            Some("unparsable address")
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(
                target = "peerlink::candidates",
                address = %candidate.address,
                ufrag = %candidate.ufrag,
                reason,
                "skipping remote candidate"
            );
            return CandidateOutcome::Skipped {
                candidate,
                reason: reason.to_string(),
            };
        }
        self.applied.push(candidate.clone());
        CandidateOutcome::Applied(candidate)
    }
}

/// Decodes a candidate signal received from the peer.
pub fn decode_remote(message: &SignalingMessage) -> Result<CandidateEvent, SessionError> {
    match message.kind {
        SignalKind::EndOfCandidates => Ok(CandidateEvent::EndOfCandidates),
        SignalKind::Candidate => serde_json::from_slice(&message.payload)
            .map(CandidateEvent::Candidate)
            .map_err(|err| SessionError::InvalidState(format!("undecodable candidate: {err}"))),
        other => Err(SessionError::InvalidState(format!(
            "{other:?} is not a candidate signal"
        ))),
    }
}

fn is_parsable(address: &str) -> bool {
    address
        .split_once("://")
        .is_some_and(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(address: &str, ufrag: &str) -> CandidateEvent {
        CandidateEvent::Candidate(ConnectivityCandidate {
            address: address.to_string(),
            ufrag: ufrag.to_string(),
            priority: 1,
        })
    }

    #[test]
    fn early_candidates_queue_and_flush_once_in_order() {
        let mut coordinator = CandidateCoordinator::new();
        let first = candidate("loop://127.0.0.1:1", "u");
        let second = candidate("loop://relay/1", "u");
        assert_eq!(
            coordinator.add_remote(first.clone()),
            Err(SessionError::PrematureCandidate { queued: 1 })
        );
        assert_eq!(
            coordinator.add_remote(second.clone()),
            Err(SessionError::PrematureCandidate { queued: 2 })
        );
        assert_eq!(
            coordinator.add_remote(first.clone()),
            Err(SessionError::PrematureCandidate { queued: 2 })
        );

        let flushed = coordinator.set_remote("u");
        let addresses: Vec<_> = flushed
            .iter()
            .map(|outcome| match outcome {
                CandidateOutcome::Applied(c) => c.address.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(addresses, vec!["loop://127.0.0.1:1", "loop://relay/1"]);
        assert_eq!(coordinator.pending(), 0);
        assert!(coordinator.set_remote("u").is_empty());
        assert_eq!(coordinator.add_remote(first), Ok(CandidateOutcome::Duplicate));
        assert_eq!(coordinator.applied().len(), 2);
    }

    #[test]
    fn mismatched_or_garbled_candidates_are_skipped() {
        let mut coordinator = CandidateCoordinator::new();
        coordinator.set_remote("good");
        assert!(matches!(
            coordinator.add_remote(candidate("loop://127.0.0.1:1", "bad")),
            Ok(CandidateOutcome::Skipped { reason, .. }) if reason == "credential mismatch"
        ));
        assert!(matches!(
            coordinator.add_remote(candidate("nonsense", "good")),
            Ok(CandidateOutcome::Skipped { reason, .. }) if reason == "unparsable address"
        ));
        assert!(coordinator.applied().is_empty());
    }

    #[test]
    fn end_of_candidates_marks_round_complete() {
        let mut coordinator = CandidateCoordinator::new();
        coordinator.set_remote("u");
        assert_eq!(
            coordinator.add_remote(CandidateEvent::EndOfCandidates),
            Ok(CandidateOutcome::EndOfCandidates)
        );
        assert!(coordinator.remote_complete());
    }

    #[test]
    fn local_candidates_become_signals() {
        let mut coordinator = CandidateCoordinator::new();
        let from = PeerId::new("a");
        let message = coordinator
            .on_local(&from, &candidate("loop://127.0.0.1:9", "u"))
            .expect("wrap");
        assert_eq!(message.kind, SignalKind::Candidate);
        assert_eq!(message.from, from);
        assert_eq!(
            decode_remote(&message).expect("decode"),
            candidate("loop://127.0.0.1:9", "u")
        );

        let end = coordinator
            .on_local(&from, &CandidateEvent::EndOfCandidates)
            .expect("wrap end");
        assert_eq!(decode_remote(&end).expect("decode"), CandidateEvent::EndOfCandidates);
        assert_eq!(coordinator.local_forwarded(), 1);
        assert!(coordinator.local_complete());
    }
}
