//! Inbound payload routing.
//!
//! Delivery from the network never blocks: payloads are appended to a
//! per-channel queue and the sink for the channel's kind is woken. Queues
//! are unbounded; their depth is observable and the application owns any
//! drop policy (see [`PayloadRouter::retain_latest`]).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::channel::{DataChannel, StreamId};
use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    Binary,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => f.write_str("text"),
            PayloadKind::Binary => f.write_str("binary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadKind,
    pub bytes: Bytes,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            bytes: Bytes::from(text.into()),
        }
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Binary,
            bytes: bytes.into(),
        }
    }
}

/// A payload handed to a consumer, tagged with the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPayload {
    pub stream: StreamId,
    pub channel_id: Option<u16>,
    pub label: String,
    pub kind: PayloadKind,
    pub bytes: Bytes,
}

impl ReceivedPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            PayloadKind::Text => std::str::from_utf8(&self.bytes).ok(),
            PayloadKind::Binary => None,
        }
    }
}

#[derive(Debug)]
struct ChannelQueue {
    label: String,
    channel_id: Option<u16>,
    kind: PayloadKind,
    items: VecDeque<(u64, Bytes)>,
    delivered: u64,
}

#[derive(Debug, Default)]
struct RouterState {
    queues: HashMap<StreamId, ChannelQueue>,
    next_seq: u64,
    released: bool,
}

impl RouterState {
    /// Oldest queued payload of `kind` across channels, by arrival order.
    fn pop_next(&mut self, kind: PayloadKind) -> Option<ReceivedPayload> {
        let (stream, _) = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.kind == kind)
            .filter_map(|(stream, queue)| queue.items.front().map(|(seq, _)| (*stream, *seq)))
            .min_by_key(|(_, seq)| *seq)?;
        let queue = self.queues.get_mut(&stream)?;
        let (_, bytes) = queue.items.pop_front()?;
        queue.delivered += 1;
        Some(ReceivedPayload {
            stream,
            channel_id: queue.channel_id,
            label: queue.label.clone(),
            kind: queue.kind,
            bytes,
        })
    }
}

#[derive(Debug, Default)]
struct RouterInner {
    state: Mutex<RouterState>,
    text_ready: Notify,
    binary_ready: Notify,
}

impl RouterInner {
    fn notify_for(&self, kind: PayloadKind) -> &Notify {
        match kind {
            PayloadKind::Text => &self.text_ready,
            PayloadKind::Binary => &self.binary_ready,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PayloadRouter {
    inner: Arc<RouterInner>,
}

impl PayloadRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `payload` for the consumer of `channel`'s kind. A payload whose
    /// kind differs from the channel's declared kind is dropped and reported.
    pub fn dispatch(&self, channel: &DataChannel, payload: Payload) -> Result<(), SessionError> {
        if payload.kind != channel.kind {
            warn!(
                target = "peerlink::router",
                stream = channel.stream,
                label = %channel.label,
                expected = %channel.kind,
                actual = %payload.kind,
                "dropping payload with mismatched kind"
            );
            return Err(SessionError::ChannelKindViolation {
                label: channel.label.clone(),
                expected: channel.kind,
                actual: payload.kind,
            });
        }

        let depth = {
            let mut state = self.inner.state.lock();
            if state.released {
                debug!(
                    target = "peerlink::router",
                    stream = channel.stream,
                    "router released, dropping payload"
                );
                return Err(SessionError::Closed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let queue = state
                .queues
                .entry(channel.stream)
                .or_insert_with(|| ChannelQueue {
                    label: channel.label.clone(),
                    channel_id: channel.id,
                    kind: channel.kind,
                    items: VecDeque::new(),
                    delivered: 0,
                });
            queue.items.push_back((seq, payload.bytes));
            queue.items.len()
        };
        trace!(
            target = "peerlink::router",
            stream = channel.stream,
            kind = %channel.kind,
            depth,
            "payload queued"
        );
        self.inner.notify_for(channel.kind).notify_one();
        Ok(())
    }

    pub fn text_sink(&self) -> PayloadSink {
        PayloadSink {
            inner: Arc::clone(&self.inner),
            kind: PayloadKind::Text,
        }
    }

    pub fn binary_sink(&self) -> PayloadSink {
        PayloadSink {
            inner: Arc::clone(&self.inner),
            kind: PayloadKind::Binary,
        }
    }

    pub fn queue_depth(&self, stream: StreamId) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(&stream)
            .map(|queue| queue.items.len())
            .unwrap_or(0)
    }

    pub fn total_depth(&self) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .values()
            .map(|queue| queue.items.len())
            .sum()
    }

    pub fn delivered(&self, stream: StreamId) -> u64 {
        self.inner
            .state
            .lock()
            .queues
            .get(&stream)
            .map(|queue| queue.delivered)
            .unwrap_or(0)
    }

    /// Drops all but the newest `keep` queued payloads on `stream` and
    /// returns how many were dropped.
    pub fn retain_latest(&self, stream: StreamId, keep: usize) -> usize {
        let mut state = self.inner.state.lock();
        let Some(queue) = state.queues.get_mut(&stream) else {
            return 0;
        };
        let excess = queue.items.len().saturating_sub(keep);
        queue.items.drain(..excess);
        excess
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.lock().released
    }

    /// Discards every queued payload and ends all sinks.
    pub fn release(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            let dropped: usize = state.queues.values().map(|queue| queue.items.len()).sum();
            state.queues.clear();
            dropped
        };
        debug!(target = "peerlink::router", dropped, "router released");
        for notify in [&self.inner.text_ready, &self.inner.binary_ready] {
            notify.notify_waiters();
            notify.notify_one();
        }
    }

    /// Accepts payloads again after [`release`](Self::release).
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.released = false;
        state.queues.clear();
    }
}

/// Consumer side for one payload kind.
#[derive(Debug, Clone)]
pub struct PayloadSink {
    inner: Arc<RouterInner>,
    kind: PayloadKind,
}

impl PayloadSink {
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn try_recv(&self) -> Option<ReceivedPayload> {
        self.inner.state.lock().pop_next(self.kind)
    }

    /// Waits for the next payload of this sink's kind. Returns `None` once
    /// the router has been released.
    pub async fn recv(&self) -> Option<ReceivedPayload> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(payload) = state.pop_next(self.kind) {
                    return Some(payload);
                }
                if state.released {
                    return None;
                }
            }
            self.inner.notify_for(self.kind).notified().await;
        }
    }
}
