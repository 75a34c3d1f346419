//! Data channel bookkeeping for one endpoint.
//!
//! The registry is a pure state machine: it never touches the network. Every
//! operation returns the [`ChannelEffect`]s the owning endpoint must carry out
//! (frames to send, notifications to publish, agreement deadlines to arm).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::router::PayloadKind;
use crate::transport::Frame;

pub type StreamId = u16;

/// First stream id handed out to in-band channels. Pre-negotiated ids must
/// stay below it.
pub const IN_BAND_BASE: StreamId = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    PreNegotiated,
    InBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }
}

/// What the application asks for when opening a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub label: String,
    pub kind: PayloadKind,
    pub mode: ChannelMode,
    pub id: Option<u16>,
}

impl ChannelSpec {
    pub fn negotiated(label: impl Into<String>, id: u16, kind: PayloadKind) -> Self {
        Self {
            label: label.into(),
            kind,
            mode: ChannelMode::PreNegotiated,
            id: Some(id),
        }
    }

    pub fn in_band(label: impl Into<String>, kind: PayloadKind) -> Self {
        Self {
            label: label.into(),
            kind,
            mode: ChannelMode::InBand,
            id: None,
        }
    }
}

/// Snapshot of a channel owned by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannel {
    pub label: String,
    /// Agreed id; only present for pre-negotiated channels.
    pub id: Option<u16>,
    /// Wire stream the channel's frames travel on.
    pub stream: StreamId,
    pub mode: ChannelMode,
    pub kind: PayloadKind,
    pub state: ChannelState,
    /// False when the peer created the channel in-band.
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened(DataChannel),
    /// The peer created an in-band channel; it is already open here.
    Announced(DataChannel),
    Closed(DataChannel),
    Failed {
        channel: DataChannel,
        error: SessionError,
    },
}

impl ChannelEvent {
    pub fn channel(&self) -> &DataChannel {
        match self {
            ChannelEvent::Opened(channel)
            | ChannelEvent::Announced(channel)
            | ChannelEvent::Closed(channel)
            | ChannelEvent::Failed { channel, .. } => channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEffect {
    Send(Frame),
    Notify(ChannelEvent),
    ArmDeadline { stream: StreamId, epoch: u64 },
}

#[derive(Debug)]
struct Entry {
    channel: DataChannel,
    epoch: u64,
    closed_by_app: bool,
}

#[derive(Debug)]
pub struct ChannelRegistry {
    entries: BTreeMap<StreamId, Entry>,
    /// Pre-negotiated announcements received before a local match existed.
    announced: HashMap<StreamId, (String, PayloadKind)>,
    next_in_band: StreamId,
    parity: StreamId,
    next_epoch: u64,
    open_timeout: Duration,
}

impl ChannelRegistry {
    /// `odd_streams` picks which half of the in-band id space this side
    /// allocates from; the two endpoints of a session must disagree.
    pub fn new(odd_streams: bool, open_timeout: Duration) -> Self {
        let parity = StreamId::from(odd_streams);
        Self {
            entries: BTreeMap::new(),
            announced: HashMap::new(),
            next_in_band: IN_BAND_BASE + parity,
            parity,
            next_epoch: 0,
            open_timeout,
        }
    }

    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    pub fn get(&self, stream: StreamId) -> Option<&DataChannel> {
        self.entries.get(&stream).map(|entry| &entry.channel)
    }

    pub fn list(&self) -> Vec<DataChannel> {
        self.entries
            .values()
            .map(|entry| entry.channel.clone())
            .collect()
    }

    pub fn open(
        &mut self,
        spec: ChannelSpec,
        link_up: bool,
    ) -> Result<(DataChannel, Vec<ChannelEffect>), SessionError> {
        let stream = match spec.mode {
            ChannelMode::PreNegotiated => {
                let id = spec.id.ok_or_else(|| {
                    SessionError::InvalidState(format!(
                        "pre-negotiated channel {:?} needs an id",
                        spec.label
                    ))
                })?;
                if id >= IN_BAND_BASE {
                    return Err(SessionError::InvalidState(format!(
                        "pre-negotiated id {id} is reserved for in-band channels"
                    )));
                }
                if let Some(existing) = self.entries.get(&id)
                    && !existing.channel.state.is_terminal()
                {
                    return Err(SessionError::InvalidState(format!(
                        "channel id {id} already used by {:?}",
                        existing.channel.label
                    )));
                }
                id
            }
            ChannelMode::InBand => {
                if spec.id.is_some() {
                    return Err(SessionError::InvalidState(
                        "in-band channels are assigned their stream by the registry".into(),
                    ));
                }
                self.allocate_in_band()?
            }
        };

        let channel = DataChannel {
            label: spec.label,
            id: spec.id,
            stream,
            mode: spec.mode,
            kind: spec.kind,
            state: ChannelState::Connecting,
            local: true,
        };
        let epoch = self.bump_epoch();
        self.entries.insert(
            stream,
            Entry {
                channel: channel.clone(),
                epoch,
                closed_by_app: false,
            },
        );
        debug!(
            target = "peerlink::channel",
            stream,
            label = %channel.label,
            mode = ?channel.mode,
            kind = %channel.kind,
            "channel requested"
        );

        let mut effects = Vec::new();
        if link_up {
            self.start_agreement(stream, &mut effects);
        }
        let snapshot = self.get(stream).cloned().unwrap_or(channel);
        Ok((snapshot, effects))
    }

    /// The network path just became usable: announce every channel still
    /// waiting for agreement.
    pub fn on_link_up(&mut self) -> Vec<ChannelEffect> {
        let waiting: Vec<StreamId> = self
            .entries
            .values()
            .filter(|entry| entry.channel.local && entry.channel.state == ChannelState::Connecting)
            .map(|entry| entry.channel.stream)
            .collect();
        let mut effects = Vec::new();
        for stream in waiting {
            self.start_agreement(stream, &mut effects);
        }
        effects
    }

    pub fn on_frame(&mut self, frame: Frame) -> Vec<ChannelEffect> {
        let mut effects = Vec::new();
        match frame {
            Frame::Announce {
                stream,
                label,
                kind,
            } => self.on_announce(stream, label, kind, &mut effects),
            Frame::Open {
                stream,
                label,
                kind,
            } => self.on_open_request(stream, label, kind, &mut effects),
            Frame::OpenAck { stream } => {
                if let Some(entry) = self.entries.get_mut(&stream)
                    && entry.channel.mode == ChannelMode::InBand
                    && entry.channel.state == ChannelState::Connecting
                {
                    entry.channel.state = ChannelState::Open;
                    effects.push(ChannelEffect::Notify(ChannelEvent::Opened(
                        entry.channel.clone(),
                    )));
                }
            }
            Frame::Close { stream } => {
                self.announced.remove(&stream);
                if let Some(entry) = self.entries.get_mut(&stream) {
                    if !entry.channel.state.is_terminal() {
                        entry.channel.state = ChannelState::Closed;
                        effects.push(ChannelEffect::Notify(ChannelEvent::Closed(
                            entry.channel.clone(),
                        )));
                    }
                    effects.push(ChannelEffect::Send(Frame::CloseAck { stream }));
                }
            }
            Frame::CloseAck { stream } => {
                if let Some(entry) = self.entries.get_mut(&stream)
                    && entry.channel.state == ChannelState::Closing
                {
                    entry.channel.state = ChannelState::Closed;
                    effects.push(ChannelEffect::Notify(ChannelEvent::Closed(
                        entry.channel.clone(),
                    )));
                }
            }
            other => {
                debug!(
                    target = "peerlink::channel",
                    frame = other.name(),
                    "ignoring non-channel frame"
                );
            }
        }
        effects
    }

    /// Closes one channel. Siblings are untouched; closing an already closed
    /// or closing channel does nothing.
    pub fn close(
        &mut self,
        stream: StreamId,
        link_up: bool,
    ) -> Result<(DataChannel, Vec<ChannelEffect>), SessionError> {
        let entry = self
            .entries
            .get_mut(&stream)
            .ok_or(SessionError::UnknownChannel(stream))?;
        entry.closed_by_app = true;
        let mut effects = Vec::new();
        match entry.channel.state {
            ChannelState::Open if link_up => {
                entry.channel.state = ChannelState::Closing;
                effects.push(ChannelEffect::Send(Frame::Close { stream }));
            }
            ChannelState::Open | ChannelState::Connecting => {
                if link_up {
                    effects.push(ChannelEffect::Send(Frame::Close { stream }));
                }
                entry.channel.state = ChannelState::Closed;
                effects.push(ChannelEffect::Notify(ChannelEvent::Closed(
                    entry.channel.clone(),
                )));
            }
            ChannelState::Closing | ChannelState::Closed | ChannelState::Failed => {}
        }
        Ok((entry.channel.clone(), effects))
    }

    /// Forces every live channel closed, each notified exactly once.
    pub fn close_all(&mut self, link_up: bool) -> Vec<ChannelEffect> {
        let mut effects = Vec::new();
        for entry in self.entries.values_mut() {
            let state = entry.channel.state;
            if state.is_terminal() {
                continue;
            }
            entry.closed_by_app = true;
            if link_up && state == ChannelState::Open {
                effects.push(ChannelEffect::Send(Frame::Close {
                    stream: entry.channel.stream,
                }));
            }
            entry.channel.state = ChannelState::Closed;
            effects.push(ChannelEffect::Notify(ChannelEvent::Closed(
                entry.channel.clone(),
            )));
        }
        self.announced.clear();
        effects
    }

    /// The owning endpoint failed: channels still connecting fail, open ones
    /// close.
    pub fn fail_all(&mut self, error: &SessionError) -> Vec<ChannelEffect> {
        let mut effects = Vec::new();
        for entry in self.entries.values_mut() {
            match entry.channel.state {
                ChannelState::Connecting => {
                    entry.channel.state = ChannelState::Failed;
                    effects.push(ChannelEffect::Notify(ChannelEvent::Failed {
                        channel: entry.channel.clone(),
                        error: error.clone(),
                    }));
                }
                ChannelState::Open | ChannelState::Closing => {
                    entry.channel.state = ChannelState::Closed;
                    effects.push(ChannelEffect::Notify(ChannelEvent::Closed(
                        entry.channel.clone(),
                    )));
                }
                ChannelState::Closed | ChannelState::Failed => {}
            }
        }
        self.announced.clear();
        effects
    }

    /// A pre-negotiated agreement deadline fired. Stale deadlines (channel
    /// reopened or already settled) are ignored.
    pub fn on_deadline(&mut self, stream: StreamId, epoch: u64) -> Vec<ChannelEffect> {
        let mut effects = Vec::new();
        let Some(entry) = self.entries.get_mut(&stream) else {
            return effects;
        };
        if entry.epoch != epoch || entry.channel.state != ChannelState::Connecting {
            return effects;
        }
        entry.channel.state = ChannelState::Failed;
        let error = SessionError::ChannelAgreement {
            label: entry.channel.label.clone(),
            id: entry.channel.id.unwrap_or(stream),
            waited: self.open_timeout,
        };
        warn!(
            target = "peerlink::channel",
            stream,
            label = %entry.channel.label,
            waited_ms = self.open_timeout.as_millis() as u64,
            "peer never agreed on pre-negotiated channel"
        );
        effects.push(ChannelEffect::Notify(ChannelEvent::Failed {
            channel: entry.channel.clone(),
            error,
        }));
        effects
    }

    /// Validates an outbound payload against the channel it targets.
    pub fn check_send(&self, stream: StreamId, kind: PayloadKind) -> Result<&DataChannel, SessionError> {
        let channel = self.get(stream).ok_or(SessionError::UnknownChannel(stream))?;
        if channel.state != ChannelState::Open {
            return Err(SessionError::InvalidState(format!(
                "channel {:?} is {:?}, not open",
                channel.label, channel.state
            )));
        }
        if channel.kind != kind {
            return Err(SessionError::ChannelKindViolation {
                label: channel.label.clone(),
                expected: channel.kind,
                actual: kind,
            });
        }
        Ok(channel)
    }

    /// Channel an inbound payload on `stream` belongs to, if it may still
    /// carry data.
    pub fn inbound(&self, stream: StreamId) -> Option<&DataChannel> {
        self.get(stream).filter(|channel| {
            matches!(channel.state, ChannelState::Open | ChannelState::Closing)
        })
    }

    /// Prepares for a fresh negotiation round after a failure: local
    /// pre-negotiated channels the application did not close go back to
    /// connecting, everything else is forgotten.
    pub fn reactivate(&mut self) {
        self.entries.retain(|_, entry| {
            entry.channel.local
                && entry.channel.mode == ChannelMode::PreNegotiated
                && !entry.closed_by_app
        });
        let epochs: Vec<StreamId> = self.entries.keys().copied().collect();
        for stream in epochs {
            let epoch = self.bump_epoch();
            if let Some(entry) = self.entries.get_mut(&stream) {
                entry.channel.state = ChannelState::Connecting;
                entry.epoch = epoch;
            }
        }
        self.announced.clear();
        self.next_in_band = IN_BAND_BASE + self.parity;
    }

    /// Drops every channel; used when an endpoint is reopened.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.announced.clear();
        self.next_in_band = IN_BAND_BASE + self.parity;
    }

    fn start_agreement(&mut self, stream: StreamId, effects: &mut Vec<ChannelEffect>) {
        let Some(entry) = self.entries.get(&stream) else {
            return;
        };
        let channel = &entry.channel;
        match channel.mode {
            ChannelMode::PreNegotiated => {
                effects.push(ChannelEffect::Send(Frame::Announce {
                    stream,
                    label: channel.label.clone(),
                    kind: channel.kind,
                }));
                effects.push(ChannelEffect::ArmDeadline {
                    stream,
                    epoch: entry.epoch,
                });
                let matched = self
                    .announced
                    .get(&stream)
                    .is_some_and(|(label, kind)| *label == channel.label && *kind == channel.kind);
                if matched {
                    self.announced.remove(&stream);
                    self.mark_open(stream, effects);
                }
            }
            ChannelMode::InBand => {
                effects.push(ChannelEffect::Send(Frame::Open {
                    stream,
                    label: channel.label.clone(),
                    kind: channel.kind,
                }));
            }
        }
    }

    fn on_announce(
        &mut self,
        stream: StreamId,
        label: String,
        kind: PayloadKind,
        effects: &mut Vec<ChannelEffect>,
    ) {
        let local = self
            .entries
            .get(&stream)
            .filter(|entry| entry.channel.mode == ChannelMode::PreNegotiated)
            .map(|entry| (entry.channel.state, entry.channel.label.clone(), entry.channel.kind));
        match local {
            Some((ChannelState::Connecting, local_label, local_kind))
                if local_label == label && local_kind == kind =>
            {
                self.mark_open(stream, effects);
            }
            Some((ChannelState::Connecting, local_label, local_kind)) => {
                warn!(
                    target = "peerlink::channel",
                    stream,
                    local_label = %local_label,
                    remote_label = %label,
                    local_kind = %local_kind,
                    remote_kind = %kind,
                    "peer announced a different channel on the same id"
                );
            }
            // A closed or failed entry no longer claims the id; keep the
            // announcement for the next local open.
            Some((state, ..)) if state.is_terminal() => {
                debug!(
                    target = "peerlink::channel",
                    stream,
                    label = %label,
                    previous = ?state,
                    "peer re-announced a settled channel"
                );
                self.announced.insert(stream, (label, kind));
            }
            Some(_) => {}
            None => {
                debug!(
                    target = "peerlink::channel",
                    stream,
                    label = %label,
                    "peer announced channel before a local match"
                );
                self.announced.insert(stream, (label, kind));
            }
        }
    }

    fn on_open_request(
        &mut self,
        stream: StreamId,
        label: String,
        kind: PayloadKind,
        effects: &mut Vec<ChannelEffect>,
    ) {
        if let Some(existing) = self.entries.get(&stream) {
            if existing.channel.local || !existing.channel.state.is_terminal() {
                warn!(
                    target = "peerlink::channel",
                    stream,
                    label = %label,
                    "rejecting in-band channel on a stream already in use"
                );
                effects.push(ChannelEffect::Send(Frame::Close { stream }));
                return;
            }
        }
        if stream < IN_BAND_BASE || stream % 2 == self.parity {
            warn!(
                target = "peerlink::channel",
                stream,
                label = %label,
                "rejecting in-band channel outside the peer's stream range"
            );
            effects.push(ChannelEffect::Send(Frame::Close { stream }));
            return;
        }
        let channel = DataChannel {
            label,
            id: None,
            stream,
            mode: ChannelMode::InBand,
            kind,
            state: ChannelState::Open,
            local: false,
        };
        let epoch = self.bump_epoch();
        self.entries.insert(
            stream,
            Entry {
                channel: channel.clone(),
                epoch,
                closed_by_app: false,
            },
        );
        debug!(
            target = "peerlink::channel",
            stream,
            label = %channel.label,
            "peer announced in-band channel"
        );
        effects.push(ChannelEffect::Send(Frame::OpenAck { stream }));
        effects.push(ChannelEffect::Notify(ChannelEvent::Announced(channel)));
    }

    fn mark_open(&mut self, stream: StreamId, effects: &mut Vec<ChannelEffect>) {
        if let Some(entry) = self.entries.get_mut(&stream) {
            entry.channel.state = ChannelState::Open;
            debug!(
                target = "peerlink::channel",
                stream,
                label = %entry.channel.label,
                "channel open"
            );
            effects.push(ChannelEffect::Notify(ChannelEvent::Opened(
                entry.channel.clone(),
            )));
        }
    }

    fn allocate_in_band(&mut self) -> Result<StreamId, SessionError> {
        let mut candidate = self.next_in_band;
        loop {
            let free = self
                .entries
                .get(&candidate)
                .is_none_or(|entry| entry.channel.state.is_terminal());
            if free {
                self.next_in_band = candidate.checked_add(2).unwrap_or(IN_BAND_BASE + self.parity);
                return Ok(candidate);
            }
            candidate = match candidate.checked_add(2) {
                Some(next) => next,
                None => IN_BAND_BASE + self.parity,
            };
            if candidate == self.next_in_band {
                return Err(SessionError::InvalidState(
                    "no in-band stream ids left".into(),
                ));
            }
        }
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn sent(effects: &[ChannelEffect]) -> Vec<Frame> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                ChannelEffect::Send(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    fn notified(effects: &[ChannelEffect]) -> Vec<ChannelEvent> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                ChannelEffect::Notify(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivers frames between two registries until both are quiet.
    fn pump(a: &mut ChannelRegistry, b: &mut ChannelRegistry, mut to_b: Vec<Frame>) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        let mut to_a = Vec::new();
        while !to_a.is_empty() || !to_b.is_empty() {
            for frame in std::mem::take(&mut to_b) {
                let effects = b.on_frame(frame);
                events.extend(notified(&effects));
                to_a.extend(sent(&effects));
            }
            for frame in std::mem::take(&mut to_a) {
                let effects = a.on_frame(frame);
                events.extend(notified(&effects));
                to_b.extend(sent(&effects));
            }
        }
        events
    }

    #[test]
    fn matching_pre_negotiated_channels_open_on_both_sides() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        let mut b = ChannelRegistry::new(true, TIMEOUT);
        let (held, effects) = a
            .open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), false)
            .expect("open a");
        assert_eq!(held.state, ChannelState::Connecting);
        assert!(effects.is_empty());
        b.open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), false)
            .expect("open b");

        let a_up = a.on_link_up();
        assert!(a_up.contains(&ChannelEffect::ArmDeadline { stream: 1, epoch: 1 }));
        let b_up = b.on_link_up();
        let mut events = pump(&mut a, &mut b, sent(&a_up));
        events.extend(pump(&mut b, &mut a, sent(&b_up)));

        assert_eq!(a.get(1).map(|c| c.state), Some(ChannelState::Open));
        assert_eq!(b.get(1).map(|c| c.state), Some(ChannelState::Open));
        let opened = events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Opened(_)))
            .count();
        assert_eq!(opened, 2);
    }

    #[test]
    fn mismatched_ids_never_open_and_fail_at_deadline() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        let mut b = ChannelRegistry::new(true, TIMEOUT);
        a.open(ChannelSpec::negotiated("img", 2, PayloadKind::Binary), false)
            .expect("open a");
        b.open(ChannelSpec::negotiated("img", 3, PayloadKind::Binary), false)
            .expect("open b");
        let a_up = a.on_link_up();
        let b_up = b.on_link_up();
        assert!(pump(&mut a, &mut b, sent(&a_up)).is_empty());
        assert!(pump(&mut b, &mut a, sent(&b_up)).is_empty());
        assert_eq!(a.get(2).map(|c| c.state), Some(ChannelState::Connecting));

        let effects = a.on_deadline(2, 1);
        match notified(&effects).as_slice() {
            [ChannelEvent::Failed { channel, error }] => {
                assert_eq!(channel.state, ChannelState::Failed);
                assert_eq!(
                    *error,
                    SessionError::ChannelAgreement {
                        label: "img".into(),
                        id: 2,
                        waited: TIMEOUT,
                    }
                );
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(a.on_deadline(2, 1).is_empty());
    }

    #[test]
    fn stale_deadline_is_ignored_after_open() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        a.open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), true)
            .expect("open");
        a.on_frame(Frame::Announce {
            stream: 1,
            label: "msg".into(),
            kind: PayloadKind::Text,
        });
        assert!(a.on_deadline(1, 1).is_empty());
        assert_eq!(a.get(1).map(|c| c.state), Some(ChannelState::Open));
    }

    #[test]
    fn in_band_channel_is_announced_to_the_peer() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        let mut b = ChannelRegistry::new(true, TIMEOUT);
        let (channel, effects) = a
            .open(ChannelSpec::in_band("chat", PayloadKind::Text), true)
            .expect("open");
        assert_eq!(channel.stream, IN_BAND_BASE);
        assert_eq!(channel.id, None);

        let events = pump(&mut a, &mut b, sent(&effects));
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Announced(remote), ChannelEvent::Opened(local)]
                if !remote.local && remote.label == "chat" && local.local
        ));
        assert_eq!(b.get(IN_BAND_BASE).map(|c| c.state), Some(ChannelState::Open));

        let (second, _) = b
            .open(ChannelSpec::in_band("files", PayloadKind::Binary), true)
            .expect("open on b");
        assert_eq!(second.stream, IN_BAND_BASE + 1);
    }

    #[test]
    fn close_is_idempotent_and_leaves_siblings_open() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        let mut b = ChannelRegistry::new(true, TIMEOUT);
        for registry in [&mut a, &mut b] {
            registry
                .open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), false)
                .expect("msg");
            registry
                .open(ChannelSpec::negotiated("img", 2, PayloadKind::Binary), false)
                .expect("img");
        }
        let a_up = a.on_link_up();
        let b_up = b.on_link_up();
        pump(&mut a, &mut b, sent(&a_up));
        pump(&mut b, &mut a, sent(&b_up));

        let (closing, effects) = a.close(1, true).expect("close");
        assert_eq!(closing.state, ChannelState::Closing);
        let mut events = notified(&effects);
        events.extend(pump(&mut a, &mut b, sent(&effects)));
        let (again, repeat) = a.close(1, true).expect("close again");
        assert_eq!(again.state, ChannelState::Closed);
        assert!(repeat.is_empty());

        let closed = events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Closed(c) if c.stream == 1))
            .count();
        assert_eq!(closed, 2, "one notification per side");
        assert_eq!(a.get(2).map(|c| c.state), Some(ChannelState::Open));
        assert_eq!(b.get(2).map(|c| c.state), Some(ChannelState::Open));
        assert_eq!(a.close(9, true).unwrap_err(), SessionError::UnknownChannel(9));
    }

    #[test]
    fn reopened_id_matches_an_announcement_that_arrived_first() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        let mut b = ChannelRegistry::new(true, TIMEOUT);
        for registry in [&mut a, &mut b] {
            registry
                .open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), false)
                .expect("msg");
        }
        let a_up = a.on_link_up();
        let b_up = b.on_link_up();
        pump(&mut a, &mut b, sent(&a_up));
        pump(&mut b, &mut a, sent(&b_up));

        let (_, effects) = a.close(1, true).expect("close");
        pump(&mut a, &mut b, sent(&effects));
        assert_eq!(a.get(1).map(|c| c.state), Some(ChannelState::Closed));
        assert_eq!(b.get(1).map(|c| c.state), Some(ChannelState::Closed));

        let (_, a_open) = a
            .open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), true)
            .expect("reopen a");
        assert!(pump(&mut a, &mut b, sent(&a_open)).is_empty());
        assert_eq!(b.get(1).map(|c| c.state), Some(ChannelState::Closed));

        let (reopened, b_open) = b
            .open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), true)
            .expect("reopen b");
        assert_eq!(reopened.state, ChannelState::Open);
        let events = pump(&mut b, &mut a, sent(&b_open));
        assert!(matches!(events.as_slice(), [ChannelEvent::Opened(c)] if c.stream == 1));
        assert_eq!(a.get(1).map(|c| c.state), Some(ChannelState::Open));
    }

    #[test]
    fn close_all_notifies_each_live_channel_once() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        a.open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), false)
            .expect("msg");
        a.open(ChannelSpec::negotiated("img", 2, PayloadKind::Binary), false)
            .expect("img");
        a.close(2, false).expect("close img");

        let effects = a.close_all(false);
        assert_eq!(notified(&effects).len(), 1);
        assert!(a.close_all(false).is_empty());
        assert!(a.list().iter().all(|c| c.state == ChannelState::Closed));
    }

    #[test]
    fn send_checks_state_and_kind() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        a.open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), true)
            .expect("open");
        assert!(matches!(
            a.check_send(1, PayloadKind::Text),
            Err(SessionError::InvalidState(_))
        ));
        a.on_frame(Frame::Announce {
            stream: 1,
            label: "msg".into(),
            kind: PayloadKind::Text,
        });
        assert!(a.check_send(1, PayloadKind::Text).is_ok());
        assert!(matches!(
            a.check_send(1, PayloadKind::Binary),
            Err(SessionError::ChannelKindViolation { .. })
        ));
        assert_eq!(
            a.check_send(5, PayloadKind::Text).unwrap_err(),
            SessionError::UnknownChannel(5)
        );
    }

    #[test]
    fn duplicate_ids_are_rejected_until_closed() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        a.open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), false)
            .expect("open");
        assert!(matches!(
            a.open(ChannelSpec::negotiated("other", 1, PayloadKind::Text), false),
            Err(SessionError::InvalidState(_))
        ));
        a.close(1, false).expect("close");
        a.open(ChannelSpec::negotiated("other", 1, PayloadKind::Text), false)
            .expect("reuse closed id");
        assert!(matches!(
            a.open(ChannelSpec::negotiated("high", IN_BAND_BASE, PayloadKind::Text), false),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[test]
    fn failure_fails_connecting_and_closes_open_channels() {
        let mut a = ChannelRegistry::new(false, TIMEOUT);
        a.open(ChannelSpec::negotiated("msg", 1, PayloadKind::Text), true)
            .expect("msg");
        a.open(ChannelSpec::negotiated("img", 2, PayloadKind::Binary), true)
            .expect("img");
        a.on_frame(Frame::Announce {
            stream: 1,
            label: "msg".into(),
            kind: PayloadKind::Text,
        });
        let effects = a.fail_all(&SessionError::Closed);
        let events = notified(&effects);
        assert!(events.iter().any(|e| matches!(e, ChannelEvent::Closed(c) if c.stream == 1)));
        assert!(events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Failed { channel, .. } if channel.stream == 2)));

        a.reactivate();
        assert_eq!(a.list().len(), 2);
        assert!(a.list().iter().all(|c| c.state == ChannelState::Connecting));
    }
}
