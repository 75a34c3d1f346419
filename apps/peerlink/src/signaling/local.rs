use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use signal_bus::{Bus, BusError, Delivery, LocalBus};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{PeerId, SignalingMessage, SignalingTransport};
use crate::transport::TransportError;

/// In-process relay on a [`LocalBus`]. Each peer listens on its own topic;
/// envelopes travel as JSON so the bus stays payload-agnostic. Messages sent
/// to a peer that has not subscribed yet are retained until it does.
#[derive(Clone, Default)]
pub struct LocalSignaling {
    bus: Arc<LocalBus>,
}

impl LocalSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: Arc<LocalBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    fn topic(peer: &PeerId) -> String {
        format!("signal/{peer}")
    }
}

fn bus_error(err: BusError) -> TransportError {
    TransportError::Signaling(err.to_string())
}

#[async_trait]
impl SignalingTransport for LocalSignaling {
    async fn send(&self, to: &PeerId, message: SignalingMessage) -> Result<(), TransportError> {
        let encoded = serde_json::to_vec(&message)
            .map_err(|err| TransportError::Signaling(err.to_string()))?;
        let delivery = self
            .bus
            .publish(&Self::topic(to), Bytes::from(encoded))
            .map_err(bus_error)?;
        match delivery {
            Delivery::Delivered(count) => trace!(
                target = "peerlink::signaling",
                from = %message.from,
                to = %to,
                kind = ?message.kind,
                subscribers = count,
                "signal delivered"
            ),
            Delivery::Retained => debug!(
                target = "peerlink::signaling",
                from = %message.from,
                to = %to,
                kind = ?message.kind,
                "no listener yet, signal retained"
            ),
        }
        Ok(())
    }

    fn subscribe(
        &self,
        peer: &PeerId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError> {
        let mut raw = self.bus.subscribe(&Self::topic(peer)).map_err(bus_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = peer.clone();
        tokio::spawn(async move {
            while let Some(message) = raw.recv().await {
                match serde_json::from_slice::<SignalingMessage>(&message.payload) {
                    Ok(decoded) => {
                        if tx.send(decoded).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(
                        target = "peerlink::signaling",
                        peer = %peer,
                        error = %err,
                        "dropping undecodable signal"
                    ),
                }
            }
            debug!(target = "peerlink::signaling", peer = %peer, "signal stream ended");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalKind;

    #[tokio::test]
    async fn messages_arrive_in_order_per_link() {
        let signaling = LocalSignaling::new();
        let b = PeerId::new("b");
        let mut inbox = signaling.subscribe(&b).expect("subscribe");
        for idx in 0..5u8 {
            signaling
                .send(
                    &b,
                    SignalingMessage::new(PeerId::new("a"), SignalKind::Candidate, vec![idx]),
                )
                .await
                .expect("send");
        }
        for idx in 0..5u8 {
            let message = inbox.recv().await.expect("message");
            assert_eq!(message.from, PeerId::new("a"));
            assert_eq!(&message.payload[..], &[idx]);
        }
    }

    #[tokio::test]
    async fn early_messages_wait_for_subscriber() {
        let signaling = LocalSignaling::new();
        let b = PeerId::new("b");
        signaling
            .send(&b, SignalingMessage::new(PeerId::new("a"), SignalKind::Offer, "x"))
            .await
            .expect("send");
        let mut inbox = signaling.subscribe(&b).expect("subscribe");
        let message = inbox.recv().await.expect("retained message");
        assert_eq!(message.kind, SignalKind::Offer);
    }

    #[tokio::test]
    async fn closed_bus_surfaces_transport_error() {
        let signaling = LocalSignaling::new();
        signaling.bus().close();
        let err = signaling
            .send(
                &PeerId::new("b"),
                SignalingMessage::new(PeerId::new("a"), SignalKind::Offer, "x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Signaling(_)));
    }

    #[tokio::test]
    async fn garbage_on_the_topic_is_skipped() {
        let signaling = LocalSignaling::new();
        let b = PeerId::new("b");
        let mut inbox = signaling.subscribe(&b).expect("subscribe");
        signaling
            .bus()
            .publish("signal/b", Bytes::from_static(b"not json"))
            .expect("publish");
        signaling
            .send(&b, SignalingMessage::new(PeerId::new("a"), SignalKind::Answer, "y"))
            .await
            .expect("send");
        let message = inbox.recv().await.expect("message");
        assert_eq!(message.kind, SignalKind::Answer);
    }
}
