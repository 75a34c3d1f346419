//! Out-of-band message relay between endpoints. The core only needs FIFO
//! delivery per link; payloads are opaque here.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::transport::TransportError;

mod local;

pub use local::LocalSignaling;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    EndOfCandidates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    /// Endpoint that produced the message.
    pub from: PeerId,
    pub kind: SignalKind,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
}

impl SignalingMessage {
    pub fn new(from: PeerId, kind: SignalKind, payload: impl Into<Bytes>) -> Self {
        Self {
            from,
            kind,
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, to: &PeerId, message: SignalingMessage) -> Result<(), TransportError>;

    /// Stream of messages addressed to `peer`, in the order they were sent.
    fn subscribe(
        &self,
        peer: &PeerId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError>;
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_json_with_base64_payload() {
        let message = SignalingMessage::new(
            PeerId::new("a"),
            SignalKind::EndOfCandidates,
            Bytes::from_static(&[0, 159, 255]),
        );
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["from"], "a");
        assert_eq!(json["kind"], "end-of-candidates");
        assert_eq!(json["payload"], "AJ//");
        let back: SignalingMessage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, message);
    }

    #[test]
    fn random_peer_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
