use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_MAX_FRAGMENT_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_INFLIGHT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_fragment_bytes: usize,
    pub max_message_bytes: usize,
    pub max_inflight: usize,
}

impl ChunkConfig {
    pub fn new(max_fragment_bytes: usize, max_message_bytes: usize) -> Self {
        Self {
            max_fragment_bytes: max_fragment_bytes.max(1),
            max_message_bytes: max_message_bytes.max(1),
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }

    pub fn max_fragments(&self) -> usize {
        self.max_message_bytes.div_ceil(self.max_fragment_bytes)
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAGMENT_BYTES, DEFAULT_MAX_MESSAGE_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("fragment malformed: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub msg_id: u64,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

impl Fragment {
    pub fn whole(msg_id: u64, payload: Bytes) -> Self {
        Self {
            msg_id,
            seq: 0,
            total: 1,
            payload,
        }
    }
}

/// Splits one payload into fragments no larger than the configured fragment
/// size. Slices share the original buffer.
pub fn split(msg_id: u64, payload: Bytes, config: &ChunkConfig) -> Result<Vec<Fragment>, ChunkError> {
    if payload.len() > config.max_message_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    let cap = config.max_fragment_bytes;
    if payload.len() <= cap {
        return Ok(vec![Fragment::whole(msg_id, payload)]);
    }
    let total = payload.len().div_ceil(cap);
    let total_u32 = u32::try_from(total).map_err(|_| ChunkError::MessageTooLarge(payload.len()))?;
    let fragments = (0..total)
        .map(|seq| {
            let start = seq * cap;
            let end = (start + cap).min(payload.len());
            Fragment {
                msg_id,
                seq: seq as u32,
                total: total_u32,
                payload: payload.slice(start..end),
            }
        })
        .collect();
    Ok(fragments)
}

#[derive(Debug)]
struct PartialMessage {
    order: u64,
    total: u32,
    parts: Vec<Option<Bytes>>,
    received: u32,
    received_bytes: usize,
}

/// Reassembles fragments per stream. Out-of-order fragments are accepted,
/// duplicates are ignored.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<(u16, u64), PartialMessage>,
    config: ChunkConfig,
    next_order: u64,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
            next_order: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    pub fn drop_stream(&mut self, stream: u16) {
        self.partials.retain(|(owner, _), _| *owner != stream);
    }

    pub fn clear(&mut self) {
        self.partials.clear();
    }

    pub fn ingest(&mut self, stream: u16, fragment: Fragment) -> Result<Option<Bytes>, ChunkError> {
        if fragment.total == 0 {
            return Err(ChunkError::Malformed("zero fragment count"));
        }
        if fragment.seq >= fragment.total {
            return Err(ChunkError::Malformed("fragment index out of range"));
        }
        if fragment.total as usize > self.config.max_fragments() {
            return Err(ChunkError::MessageTooLarge(
                fragment.total as usize * self.config.max_fragment_bytes,
            ));
        }
        if fragment.total == 1 {
            if fragment.payload.len() > self.config.max_message_bytes {
                return Err(ChunkError::MessageTooLarge(fragment.payload.len()));
            }
            return Ok(Some(fragment.payload));
        }

        let key = (stream, fragment.msg_id);
        if !self.partials.contains_key(&key) && self.partials.len() >= self.config.max_inflight {
            self.evict_oldest();
        }
        let order = self.next_order;
        let entry = self.partials.entry(key).or_insert_with(|| PartialMessage {
            order,
            total: fragment.total,
            parts: vec![None; fragment.total as usize],
            received: 0,
            received_bytes: 0,
        });
        if entry.order == order {
            self.next_order += 1;
        }

        if entry.total != fragment.total {
            self.partials.remove(&key);
            return Err(ChunkError::Malformed("fragment count changed mid-message"));
        }

        let slot = &mut entry.parts[fragment.seq as usize];
        if slot.is_none() {
            entry.received_bytes = entry.received_bytes.saturating_add(fragment.payload.len());
            entry.received += 1;
            *slot = Some(fragment.payload);
        }
        if entry.received_bytes > self.config.max_message_bytes {
            let size = entry.received_bytes;
            self.partials.remove(&key);
            return Err(ChunkError::MessageTooLarge(size));
        }
        if entry.received < entry.total {
            return Ok(None);
        }

        let Some(complete) = self.partials.remove(&key) else {
            return Ok(None);
        };
        let mut combined = BytesMut::with_capacity(complete.received_bytes);
        for part in complete.parts {
            match part {
                Some(bytes) => combined.extend_from_slice(&bytes),
                None => return Err(ChunkError::Malformed("missing fragment during reassembly")),
            }
        }
        Ok(Some(combined.freeze()))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.order)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            warn!(
                target = "peerlink::transport",
                stream = key.0,
                msg_id = key.1,
                "evicting incomplete message to stay within reassembly budget"
            );
            self.partials.remove(&key);
        }
    }
}
