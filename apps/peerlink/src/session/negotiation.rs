//! Offer/answer state for one endpoint.

use std::fmt;

use bytes::Bytes;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionError;
use crate::media::MediaTrack;

const UFRAG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptionKind::Offer => f.write_str("offer"),
            DescriptionKind::Answer => f.write_str("answer"),
        }
    }
}

/// Versioned, immutable description blob. The payload is what travels over
/// signaling; `version` identifies the negotiation round it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub version: u64,
    pub payload: Bytes,
}

impl SessionDescription {
    /// Parses a payload received from the peer.
    pub fn decode(kind: DescriptionKind, payload: Bytes) -> Result<Self, SessionError> {
        let body = DescriptionBody::parse(&payload)?;
        Ok(Self {
            kind,
            version: body.version,
            payload,
        })
    }

    pub fn tracks(&self) -> Result<Vec<MediaTrack>, SessionError> {
        Ok(DescriptionBody::parse(&self.payload)?.tracks)
    }

    fn encode(kind: DescriptionKind, body: &DescriptionBody) -> Result<Self, SessionError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| SessionError::MalformedDescription(err.to_string()))?;
        Ok(Self {
            kind,
            version: body.version,
            payload: Bytes::from(payload),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DescriptionBody {
    pub version: u64,
    pub ufrag: String,
    pub fingerprint: String,
    #[serde(default)]
    pub tracks: Vec<MediaTrack>,
}

impl DescriptionBody {
    fn parse(payload: &[u8]) -> Result<Self, SessionError> {
        let body: DescriptionBody = serde_json::from_slice(payload)
            .map_err(|err| SessionError::MalformedDescription(err.to_string()))?;
        if body.ufrag.is_empty() || body.fingerprint.is_empty() {
            return Err(SessionError::MalformedDescription(
                "missing connectivity credentials".into(),
            ));
        }
        Ok(body)
    }
}

/// Per-round connectivity credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub fingerprint: String,
}

impl Credentials {
    pub fn generate() -> Self {
        let ufrag = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(UFRAG_LEN)
            .map(char::from)
            .collect();
        Self {
            ufrag,
            fingerprint: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Complete,
}

/// What the endpoint learned from an applied remote description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApplied {
    pub kind: DescriptionKind,
    pub ufrag: String,
    pub tracks: Vec<MediaTrack>,
}

#[derive(Debug)]
pub struct Negotiator {
    phase: NegotiationPhase,
    round: u64,
    credentials: Credentials,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_credentials: Option<Credentials>,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            phase: NegotiationPhase::Stable,
            round: 0,
            credentials: Credentials::generate(),
            local: None,
            remote: None,
            remote_credentials: None,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn local_ufrag(&self) -> &str {
        &self.credentials.ufrag
    }

    pub fn remote_ufrag(&self) -> Option<&str> {
        self.remote_credentials
            .as_ref()
            .map(|creds| creds.ufrag.as_str())
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == NegotiationPhase::Complete
    }

    /// Forgets both descriptions and rolls fresh credentials.
    pub fn begin_round(&mut self) {
        self.phase = NegotiationPhase::Stable;
        self.credentials = Credentials::generate();
        self.local = None;
        self.remote = None;
        self.remote_credentials = None;
    }

    pub fn create_offer(&mut self, tracks: &[MediaTrack]) -> Result<SessionDescription, SessionError> {
        if self.phase != NegotiationPhase::Stable || self.local.is_some() {
            return Err(SessionError::NegotiationState(format!(
                "cannot create an offer in {:?}",
                self.phase
            )));
        }
        let round = self.round + 1;
        let offer = SessionDescription::encode(DescriptionKind::Offer, &self.body(round, tracks))?;
        self.round = round;
        self.local = Some(offer.clone());
        self.phase = NegotiationPhase::HaveLocalOffer;
        debug!(target = "peerlink::negotiation", round, "local offer created");
        Ok(offer)
    }

    pub fn create_answer(&mut self, tracks: &[MediaTrack]) -> Result<SessionDescription, SessionError> {
        if self.phase != NegotiationPhase::HaveRemoteOffer || self.local.is_some() {
            return Err(SessionError::NegotiationState(format!(
                "cannot create an answer in {:?}",
                self.phase
            )));
        }
        let answer =
            SessionDescription::encode(DescriptionKind::Answer, &self.body(self.round, tracks))?;
        self.local = Some(answer.clone());
        self.phase = NegotiationPhase::Complete;
        debug!(target = "peerlink::negotiation", round = self.round, "local answer created");
        Ok(answer)
    }

    pub fn apply_remote(&mut self, description: &SessionDescription) -> Result<RemoteApplied, SessionError> {
        if self.remote.is_some() {
            return Err(SessionError::NegotiationState(format!(
                "remote description already applied for round {}",
                self.round
            )));
        }
        let body = DescriptionBody::parse(&description.payload)?;
        if body.version != description.version {
            return Err(SessionError::MalformedDescription(format!(
                "version {} does not match payload version {}",
                description.version, body.version
            )));
        }

        match (description.kind, self.phase) {
            (DescriptionKind::Offer, NegotiationPhase::Stable) => {
                if body.version <= self.round {
                    return Err(SessionError::NegotiationState(format!(
                        "offer for round {} is stale, current round is {}",
                        body.version, self.round
                    )));
                }
                self.round = body.version;
                self.phase = NegotiationPhase::HaveRemoteOffer;
            }
            (DescriptionKind::Answer, NegotiationPhase::HaveLocalOffer) => {
                if body.version != self.round {
                    return Err(SessionError::NegotiationState(format!(
                        "answer for round {} while offering round {}",
                        body.version, self.round
                    )));
                }
                self.phase = NegotiationPhase::Complete;
            }
            (kind, phase) => {
                return Err(SessionError::NegotiationState(format!(
                    "unexpected remote {kind} in {phase:?}"
                )));
            }
        }

        self.remote = Some(description.clone());
        self.remote_credentials = Some(Credentials {
            ufrag: body.ufrag.clone(),
            fingerprint: body.fingerprint,
        });
        debug!(
            target = "peerlink::negotiation",
            kind = %description.kind,
            round = self.round,
            "remote description applied"
        );
        Ok(RemoteApplied {
            kind: description.kind,
            ufrag: body.ufrag,
            tracks: body.tracks,
        })
    }

    /// Withdraws a local description that could not be advertised.
    pub fn rollback_local(&mut self) {
        match self.phase {
            NegotiationPhase::HaveLocalOffer => {
                self.phase = NegotiationPhase::Stable;
                self.round = self.round.saturating_sub(1);
            }
            NegotiationPhase::Complete if self.local.as_ref().map(|d| d.kind) == Some(DescriptionKind::Answer) => {
                self.phase = NegotiationPhase::HaveRemoteOffer;
            }
            _ => return,
        }
        self.local = None;
        debug!(target = "peerlink::negotiation", round = self.round, "local description rolled back");
    }

    fn body(&self, version: u64, tracks: &[MediaTrack]) -> DescriptionBody {
        DescriptionBody {
            version,
            ufrag: self.credentials.ufrag.clone(),
            fingerprint: self.credentials.fingerprint.clone(),
            tracks: tracks.to_vec(),
        }
    }
}
