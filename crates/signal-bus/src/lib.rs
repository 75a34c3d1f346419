//! Topic-keyed in-memory message bus.
//!
//! Every subscriber of a topic receives every message published to it, in
//! publish order, with no lag-based loss. Messages published to a topic with
//! no live subscriber are retained and handed to the first subscriber that
//! shows up, so a peer that registers late still sees what was sent to it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to this many live subscribers.
    Delivered(usize),
    /// No live subscriber yet; kept for the next one.
    Retained,
}

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> BusResult<mpsc::UnboundedReceiver<BusMessage>>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<Delivery>;
}

#[derive(Debug, Default)]
struct Topic {
    subscribers: Vec<mpsc::UnboundedSender<BusMessage>>,
    retained: VecDeque<BusMessage>,
}

/// In-process bus used as a signaling relay and in tests.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, Topic>>,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the bus. Subsequent publishes and subscribes fail with
    /// [`BusError::Closed`]; existing subscribers see their stream end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of messages waiting for a first subscriber on `topic`.
    pub fn retained(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|entry| entry.retained.len())
            .unwrap_or(0)
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> BusResult<mpsc::UnboundedReceiver<BusMessage>> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.topics.write();
        let entry = guard.entry(topic.to_string()).or_default();
        while let Some(message) = entry.retained.pop_front() {
            if tx.send(message).is_err() {
                break;
            }
        }
        entry.subscribers.push(tx);
        Ok(rx)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<Delivery> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        let mut guard = self.topics.write();
        let entry = guard.entry(topic.to_string()).or_default();
        entry.subscribers.retain(|sub| !sub.is_closed());
        if entry.subscribers.is_empty() {
            tracing::trace!(target = "signal_bus", topic, "retaining message");
            entry.retained.push_back(message);
            return Ok(Delivery::Retained);
        }
        let mut delivered = 0;
        for sub in &entry.subscribers {
            if sub.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(Delivery::Delivered(delivered))
    }
}
