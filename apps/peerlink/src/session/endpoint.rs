//! One side of a session.
//!
//! Every endpoint runs as a single task that owns its negotiator, candidate
//! coordinator, channel registry and socket. Commands from handles, signals
//! from the peer, datagrams from the network and internal timers all funnel
//! into that task, so none of that state is shared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::candidates::{self, CandidateCoordinator, CandidateOutcome};
use super::negotiation::{DescriptionKind, NegotiationPhase, Negotiator, SessionDescription};
use crate::channel::{
    ChannelEffect, ChannelEvent, ChannelRegistry, ChannelSpec, ChannelState, DataChannel, StreamId,
};
use crate::error::SessionError;
use crate::media::MediaTrack;
use crate::router::{Payload, PayloadRouter};
use crate::signaling::{PeerId, SignalKind, SignalingMessage, SignalingTransport};
use crate::transport::chunk::{self, ChunkConfig, Fragment, Reassembler};
use crate::transport::{
    Binding, CandidateEvent, ConnectivityCandidate, Datagram, DatagramSocket, Frame, Network,
    TransportError,
};

pub const DEFAULT_CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    New,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub id: PeerId,
    pub remote: PeerId,
    /// Answer remote offers as soon as they are applied.
    pub auto_answer: bool,
    /// How long a pre-negotiated channel waits for the peer's matching
    /// announcement before it fails.
    pub channel_open_timeout: Duration,
    pub chunk: ChunkConfig,
}

impl EndpointConfig {
    pub fn new(id: PeerId, remote: PeerId) -> Self {
        Self {
            id,
            remote,
            auto_answer: true,
            channel_open_timeout: DEFAULT_CHANNEL_OPEN_TIMEOUT,
            chunk: ChunkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    StateChanged(EndpointState),
    RemoteTracks(Vec<MediaTrack>),
    Channel(ChannelEvent),
    PayloadRejected {
        stream: StreamId,
        error: SessionError,
    },
    CandidateSkipped {
        candidate: ConnectivityCandidate,
        reason: String,
    },
    /// A signal could not be delivered; the endpoint's state is unchanged.
    SignalingFailed(SessionError),
    Failed(SessionError),
}

/// Point-in-time view of an endpoint, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub id: PeerId,
    pub remote: PeerId,
    pub state: EndpointState,
    pub role: Option<Role>,
    pub round: u64,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub channels: Vec<DataChannel>,
    pub remote_tracks: Vec<MediaTrack>,
    pub pending_candidates: usize,
    pub applied_candidates: usize,
    pub selected_path: Option<String>,
    pub failure: Option<SessionError>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    AttachTrack(MediaTrack, Reply<()>),
    CreateOffer(Reply<SessionDescription>),
    CreateAnswer(Reply<SessionDescription>),
    ApplyRemote(SessionDescription, Reply<()>),
    AddCandidate(CandidateEvent, Reply<CandidateOutcome>),
    OpenChannel(ChannelSpec, Reply<DataChannel>),
    CloseChannel(StreamId, Reply<DataChannel>),
    Send {
        stream: StreamId,
        payload: Payload,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<EndpointSnapshot>),
    CloseChannels(Reply<()>),
    Close {
        release_router: bool,
        reply: Reply<()>,
    },
    Reopen(Reply<()>),
    Shutdown,
}

/// Results of work the endpoint spawned. `generation` ties gathering and
/// datagram events to the socket that produced them; anything from an older
/// socket is dropped.
enum Internal {
    Gathered {
        generation: u64,
        event: CandidateEvent,
    },
    Datagram {
        generation: u64,
        datagram: Datagram,
    },
    Deadline {
        stream: StreamId,
        epoch: u64,
    },
}

/// Cloneable handle to an endpoint task.
#[derive(Clone)]
pub struct EndpointHandle {
    id: PeerId,
    remote: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<EndpointState>,
    channels: watch::Receiver<Vec<DataChannel>>,
    router: PayloadRouter,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<EndpointEvent>>>>,
    cancel: Arc<Mutex<CancellationToken>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl EndpointHandle {
    /// Starts the endpoint task. Must be called from within a Tokio runtime.
    pub fn spawn(
        config: EndpointConfig,
        signaling: Arc<dyn SignalingTransport>,
        network: Arc<dyn Network>,
    ) -> Result<Self, SessionError> {
        if config.id == config.remote {
            return Err(SessionError::InvalidState(
                "endpoint cannot pair with itself".into(),
            ));
        }
        let signals = signaling.subscribe(&config.id)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EndpointState::New);
        let (channels_tx, channels_rx) = watch::channel(Vec::new());
        let router = PayloadRouter::new();
        let cancel = Arc::new(Mutex::new(CancellationToken::new()));

        let actor = EndpointActor {
            registry: ChannelRegistry::new(config.id > config.remote, config.channel_open_timeout),
            reassembler: Reassembler::new(config.chunk),
            config: config.clone(),
            signaling,
            network,
            router: router.clone(),
            events: event_tx,
            state_tx,
            channels_tx,
            cancel: Arc::clone(&cancel),
            internal: internal_tx,
            state: EndpointState::New,
            role: None,
            negotiator: Negotiator::new(),
            candidates: CandidateCoordinator::new(),
            tracks: Vec::new(),
            remote_tracks: Vec::new(),
            socket: None,
            local_candidates: Vec::new(),
            generation: 0,
            remote_address: None,
            probed: HashSet::new(),
            next_msg_id: 0,
            failure: None,
        };
        debug!(
            target = "peerlink::session",
            peer = %config.id,
            remote = %config.remote,
            "endpoint spawned"
        );
        let task = tokio::spawn(actor.run(command_rx, signals, internal_rx));

        Ok(Self {
            id: config.id,
            remote: config.remote,
            commands: command_tx,
            state: state_rx,
            channels: channels_rx,
            router,
            events: Arc::new(Mutex::new(Some(event_rx))),
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub fn router(&self) -> &PayloadRouter {
        &self.router
    }

    /// Event stream; can be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>> {
        self.events.lock().take()
    }

    /// Tracks must be attached while the endpoint is still `New`.
    pub async fn attach_track(&self, track: MediaTrack) -> Result<(), SessionError> {
        self.request(|reply| Command::AttachTrack(track, reply)).await
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.request(Command::CreateOffer).await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        self.request(Command::CreateAnswer).await
    }

    pub async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::ApplyRemote(description, reply))
            .await
    }

    pub async fn add_remote_candidate(
        &self,
        event: CandidateEvent,
    ) -> Result<CandidateOutcome, SessionError> {
        self.request(|reply| Command::AddCandidate(event, reply))
            .await
    }

    pub async fn open_channel(&self, spec: ChannelSpec) -> Result<DataChannel, SessionError> {
        self.request(|reply| Command::OpenChannel(spec, reply)).await
    }

    pub async fn close_channel(&self, stream: StreamId) -> Result<DataChannel, SessionError> {
        self.request(|reply| Command::CloseChannel(stream, reply))
            .await
    }

    pub async fn send(&self, stream: StreamId, payload: Payload) -> Result<(), SessionError> {
        self.request(|reply| Command::Send {
            stream,
            payload,
            reply,
        })
        .await
    }

    pub async fn send_text(&self, stream: StreamId, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(stream, Payload::text(text)).await
    }

    pub async fn send_binary(
        &self,
        stream: StreamId,
        bytes: impl Into<bytes::Bytes>,
    ) -> Result<(), SessionError> {
        self.send(stream, Payload::binary(bytes)).await
    }

    pub async fn snapshot(&self) -> Result<EndpointSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Closes every channel of this endpoint, leaving the connection up.
    pub async fn close_channels(&self) -> Result<(), SessionError> {
        self.request(Command::CloseChannels).await
    }

    /// Closes channels, releases the socket and ends the payload sinks.
    /// In-flight offers and answers resolve to [`SessionError::Cancelled`].
    pub async fn close(&self) -> Result<(), SessionError> {
        self.close_inner(true).await
    }

    /// Like [`close`](Self::close) but leaves the router for the caller to
    /// release.
    pub(crate) async fn teardown(&self) -> Result<(), SessionError> {
        self.close_inner(false).await
    }

    async fn close_inner(&self, release_router: bool) -> Result<(), SessionError> {
        self.cancel.lock().cancel();
        let result = self
            .request(|reply| Command::Close {
                release_router,
                reply,
            })
            .await;
        match result {
            Err(SessionError::Closed) => {
                if release_router {
                    self.router.release();
                }
                Ok(())
            }
            other => other,
        }
    }

    /// Takes a closed endpoint back to `New` for a fresh round.
    pub async fn reopen(&self) -> Result<(), SessionError> {
        *self.cancel.lock() = CancellationToken::new();
        self.request(Command::Reopen).await
    }

    /// Stops the endpoint task after closing it.
    pub async fn shutdown(&self) {
        self.cancel.lock().cancel();
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(
                    target = "peerlink::session",
                    peer = %self.id,
                    error = %err,
                    "endpoint task ended abnormally"
                );
            }
        }
    }

    pub async fn wait_for_state(&self, target: EndpointState) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            state.changed().await.map_err(|_| SessionError::Closed)?;
        }
    }

    /// Waits until the channel on `stream` reaches `target` and returns it.
    pub async fn wait_for_channel(
        &self,
        stream: StreamId,
        target: ChannelState,
    ) -> Result<DataChannel, SessionError> {
        let mut channels = self.channels.clone();
        loop {
            let found = channels
                .borrow_and_update()
                .iter()
                .find(|channel| channel.stream == stream && channel.state == target)
                .cloned();
            if let Some(channel) = found {
                return Ok(channel);
            }
            channels.changed().await.map_err(|_| SessionError::Closed)?;
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

struct EndpointActor {
    config: EndpointConfig,
    signaling: Arc<dyn SignalingTransport>,
    network: Arc<dyn Network>,
    router: PayloadRouter,
    events: mpsc::UnboundedSender<EndpointEvent>,
    state_tx: watch::Sender<EndpointState>,
    channels_tx: watch::Sender<Vec<DataChannel>>,
    cancel: Arc<Mutex<CancellationToken>>,
    internal: mpsc::UnboundedSender<Internal>,
    state: EndpointState,
    role: Option<Role>,
    negotiator: Negotiator,
    candidates: CandidateCoordinator,
    registry: ChannelRegistry,
    reassembler: Reassembler,
    tracks: Vec<MediaTrack>,
    remote_tracks: Vec<MediaTrack>,
    socket: Option<Box<dyn DatagramSocket>>,
    local_candidates: Vec<ConnectivityCandidate>,
    generation: u64,
    remote_address: Option<String>,
    probed: HashSet<String>,
    next_msg_id: u64,
    failure: Option<SessionError>,
}

impl EndpointActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<SignalingMessage>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut signals_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                signal = signals.recv(), if signals_open => match signal {
                    Some(message) => self.on_signal(message).await,
                    None => {
                        signals_open = false;
                        warn!(
                            target = "peerlink::signaling",
                            peer = %self.config.id,
                            "signal stream ended"
                        );
                    }
                },
                Some(event) = internal.recv() => self.on_internal(event).await,
            }
        }
        self.close(true);
        debug!(target = "peerlink::session", peer = %self.config.id, "endpoint stopped");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::AttachTrack(track, reply) => {
                let _ = reply.send(self.attach_track(track));
            }
            Command::CreateOffer(reply) => {
                let _ = reply.send(self.create_offer().await);
            }
            Command::CreateAnswer(reply) => {
                let _ = reply.send(self.create_answer().await);
            }
            Command::ApplyRemote(description, reply) => {
                let _ = reply.send(self.apply_remote(description).await);
            }
            Command::AddCandidate(event, reply) => {
                let _ = reply.send(self.add_candidate(event));
            }
            Command::OpenChannel(spec, reply) => {
                let _ = reply.send(self.open_channel(spec));
            }
            Command::CloseChannel(stream, reply) => {
                let _ = reply.send(self.close_channel(stream));
            }
            Command::Send {
                stream,
                payload,
                reply,
            } => {
                let _ = reply.send(self.send_payload(stream, payload));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::CloseChannels(reply) => {
                let effects = self.registry.close_all(self.link_up());
                self.apply_effects(effects);
                let _ = reply.send(Ok(()));
            }
            Command::Close {
                release_router,
                reply,
            } => {
                self.close(release_router);
                let _ = reply.send(Ok(()));
            }
            Command::Reopen(reply) => {
                let _ = reply.send(self.reopen());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn attach_track(&mut self, track: MediaTrack) -> Result<(), SessionError> {
        if self.state != EndpointState::New {
            return Err(SessionError::TrackAttach);
        }
        if !self.tracks.iter().any(|existing| existing.id == track.id) {
            debug!(
                target = "peerlink::negotiation",
                peer = %self.config.id,
                track = %track.id,
                kind = ?track.kind,
                "track attached"
            );
            self.tracks.push(track);
        }
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        match self.state {
            EndpointState::New => {}
            EndpointState::Failed => self.prepare_restart(),
            other => {
                return Err(SessionError::InvalidState(format!(
                    "cannot create an offer while {other:?}"
                )));
            }
        }
        let offer = self.negotiator.create_offer(&self.tracks)?;
        if let Err(err) = self.bind() {
            self.negotiator.rollback_local();
            return Err(err);
        }
        if let Err(err) = self.advertise(SignalKind::Offer, &offer).await {
            self.negotiator.rollback_local();
            self.unbind();
            return Err(err);
        }
        self.role = Some(Role::Offerer);
        self.failure = None;
        self.set_state(EndpointState::Negotiating);
        self.start_gathering();
        Ok(offer)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, SessionError> {
        if self.state != EndpointState::Negotiating
            || self.negotiator.phase() != NegotiationPhase::HaveRemoteOffer
        {
            return Err(SessionError::InvalidState(
                "no remote offer is waiting for an answer".into(),
            ));
        }
        let answer = self.negotiator.create_answer(&self.tracks)?;
        if let Err(err) = self.bind() {
            self.negotiator.rollback_local();
            return Err(err);
        }
        if let Err(err) = self.advertise(SignalKind::Answer, &answer).await {
            self.negotiator.rollback_local();
            self.unbind();
            return Err(err);
        }
        self.start_gathering();
        self.probe_applied();
        Ok(answer)
    }

    async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), SessionError> {
        match (self.state, description.kind) {
            (EndpointState::Closed, _) => return Err(SessionError::Closed),
            (EndpointState::Failed, DescriptionKind::Answer) => {
                return Err(SessionError::InvalidState(
                    "endpoint failed; a new round must start with an offer".into(),
                ));
            }
            (EndpointState::Failed, DescriptionKind::Offer) => self.prepare_restart(),
            _ => {}
        }

        let applied = match self.negotiator.apply_remote(&description) {
            Ok(applied) => applied,
            Err(err) => {
                self.fail(err.clone());
                return Err(err);
            }
        };
        if applied.kind == DescriptionKind::Offer {
            self.role = Some(Role::Answerer);
            self.failure = None;
            self.set_state(EndpointState::Negotiating);
        }
        if !applied.tracks.is_empty() {
            self.remote_tracks = applied.tracks.clone();
            self.emit(EndpointEvent::RemoteTracks(applied.tracks));
        }
        for outcome in self.candidates.set_remote(&applied.ufrag) {
            self.on_candidate_outcome(outcome);
        }
        if applied.kind == DescriptionKind::Offer && self.config.auto_answer {
            self.create_answer().await?;
        }
        self.probe_applied();
        Ok(())
    }

    fn add_candidate(&mut self, event: CandidateEvent) -> Result<CandidateOutcome, SessionError> {
        if self.state == EndpointState::Closed {
            return Err(SessionError::Closed);
        }
        let outcome = self.candidates.add_remote(event)?;
        self.on_candidate_outcome(outcome.clone());
        Ok(outcome)
    }

    fn on_candidate_outcome(&mut self, outcome: CandidateOutcome) {
        match outcome {
            CandidateOutcome::Applied(candidate) => self.probe(&candidate),
            CandidateOutcome::Skipped { candidate, reason } => {
                self.emit(EndpointEvent::CandidateSkipped { candidate, reason });
            }
            CandidateOutcome::EndOfCandidates => {
                debug!(
                    target = "peerlink::candidates",
                    peer = %self.config.id,
                    applied = self.candidates.applied().len(),
                    "remote candidates complete"
                );
            }
            CandidateOutcome::Duplicate => {}
        }
    }

    fn open_channel(&mut self, spec: ChannelSpec) -> Result<DataChannel, SessionError> {
        match self.state {
            EndpointState::Closed => return Err(SessionError::Closed),
            EndpointState::Failed => {
                return Err(SessionError::InvalidState(
                    "cannot open channels on a failed endpoint".into(),
                ));
            }
            _ => {}
        }
        let (channel, effects) = self.registry.open(spec, self.link_up())?;
        self.apply_effects(effects);
        self.publish_channels();
        Ok(self.registry.get(channel.stream).cloned().unwrap_or(channel))
    }

    fn close_channel(&mut self, stream: StreamId) -> Result<DataChannel, SessionError> {
        let (channel, effects) = self.registry.close(stream, self.link_up())?;
        self.apply_effects(effects);
        self.publish_channels();
        Ok(channel)
    }

    fn send_payload(&mut self, stream: StreamId, payload: Payload) -> Result<(), SessionError> {
        let kind = self.registry.check_send(stream, payload.kind)?.kind;
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        let fragments =
            chunk::split(msg_id, payload.bytes, &self.config.chunk).map_err(TransportError::from)?;
        trace!(
            target = "peerlink::transport",
            stream,
            msg_id,
            fragments = fragments.len(),
            "sending payload"
        );
        for fragment in fragments {
            self.send_frame(&Frame::Data {
                stream,
                kind,
                fragment,
            })?;
        }
        Ok(())
    }

    fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.config.id.clone(),
            remote: self.config.remote.clone(),
            state: self.state,
            role: self.role,
            round: self.negotiator.round(),
            local_description: self.negotiator.local_description().cloned(),
            remote_description: self.negotiator.remote_description().cloned(),
            channels: self.registry.list(),
            remote_tracks: self.remote_tracks.clone(),
            pending_candidates: self.candidates.pending(),
            applied_candidates: self.candidates.applied().len(),
            selected_path: self.remote_address.clone(),
            failure: self.failure.clone(),
        }
    }

    fn close(&mut self, release_router: bool) {
        if self.state != EndpointState::Closed {
            let effects = self.registry.close_all(self.link_up());
            self.apply_effects(effects);
            self.unbind();
            self.reassembler.clear();
            self.negotiator.begin_round();
            self.candidates.reset();
            self.set_state(EndpointState::Closed);
            info!(target = "peerlink::session", peer = %self.config.id, "endpoint closed");
        }
        if release_router {
            self.router.release();
        }
    }

    fn reopen(&mut self) -> Result<(), SessionError> {
        if self.state != EndpointState::Closed {
            return Err(SessionError::InvalidState(format!(
                "only a closed endpoint can be reopened, this one is {:?}",
                self.state
            )));
        }
        self.registry.clear();
        self.publish_channels();
        self.remote_tracks.clear();
        self.role = None;
        self.failure = None;
        self.router.reset();
        self.set_state(EndpointState::New);
        Ok(())
    }

    fn fail(&mut self, error: SessionError) {
        if matches!(self.state, EndpointState::Closed | EndpointState::Failed) {
            return;
        }
        warn!(
            target = "peerlink::session",
            peer = %self.config.id,
            error = %error,
            "endpoint failed"
        );
        let effects = self.registry.fail_all(&error);
        self.apply_effects(effects);
        self.unbind();
        self.reassembler.clear();
        self.failure = Some(error.clone());
        self.set_state(EndpointState::Failed);
        self.emit(EndpointEvent::Failed(error));
    }

    /// Resets per-round state before a failed endpoint negotiates again.
    fn prepare_restart(&mut self) {
        self.unbind();
        self.reassembler.clear();
        self.negotiator.begin_round();
        self.candidates.reset();
        self.registry.reactivate();
        self.publish_channels();
        self.remote_tracks.clear();
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        if message.from != self.config.remote {
            warn!(
                target = "peerlink::signaling",
                peer = %self.config.id,
                from = %message.from,
                "ignoring signal from unexpected peer"
            );
            return;
        }
        trace!(
            target = "peerlink::signaling",
            peer = %self.config.id,
            kind = ?message.kind,
            "signal received"
        );
        match message.kind {
            SignalKind::Offer | SignalKind::Answer => {
                if self.state == EndpointState::Closed {
                    debug!(
                        target = "peerlink::negotiation",
                        peer = %self.config.id,
                        "ignoring description for closed endpoint"
                    );
                    return;
                }
                let kind = if message.kind == SignalKind::Offer {
                    DescriptionKind::Offer
                } else {
                    DescriptionKind::Answer
                };
                let description = match SessionDescription::decode(kind, message.payload) {
                    Ok(description) => description,
                    Err(err) => {
                        self.fail(err);
                        return;
                    }
                };
                if let Err(err) = self.apply_remote(description).await {
                    if err.kind() == crate::error::ErrorKind::Transport {
                        self.emit(EndpointEvent::SignalingFailed(err));
                    } else {
                        debug!(
                            target = "peerlink::negotiation",
                            peer = %self.config.id,
                            error = %err,
                            "remote description not applied"
                        );
                    }
                }
            }
            SignalKind::Candidate | SignalKind::EndOfCandidates => {
                let event = match candidates::decode_remote(&message) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(
                            target = "peerlink::candidates",
                            peer = %self.config.id,
                            error = %err,
                            "dropping undecodable candidate"
                        );
                        return;
                    }
                };
                match self.add_candidate(event) {
                    Ok(_) | Err(SessionError::Closed) => {}
                    Err(err) if err.is_recoverable() => debug!(
                        target = "peerlink::candidates",
                        peer = %self.config.id,
                        error = %err,
                        "remote candidate deferred"
                    ),
                    Err(err) => warn!(
                        target = "peerlink::candidates",
                        peer = %self.config.id,
                        error = %err,
                        "remote candidate rejected"
                    ),
                }
            }
        }
    }

    async fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Gathered { generation, event } => {
                if generation != self.generation {
                    return;
                }
                let message = match self.candidates.on_local(&self.config.id, &event) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(
                            target = "peerlink::candidates",
                            peer = %self.config.id,
                            error = %err,
                            "could not encode local candidate"
                        );
                        return;
                    }
                };
                if let Err(err) = self.signal(message).await {
                    warn!(
                        target = "peerlink::candidates",
                        peer = %self.config.id,
                        error = %err,
                        "failed to forward local candidate"
                    );
                    self.emit(EndpointEvent::SignalingFailed(err));
                }
            }
            Internal::Datagram {
                generation,
                datagram,
            } => {
                if generation == self.generation {
                    self.on_datagram(datagram);
                }
            }
            Internal::Deadline { stream, epoch } => {
                let effects = self.registry.on_deadline(stream, epoch);
                self.apply_effects(effects);
            }
        }
    }

    fn on_datagram(&mut self, datagram: Datagram) {
        let frame = match Frame::decode(datagram.bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target = "peerlink::transport",
                    peer = %self.config.id,
                    from = %datagram.from,
                    error = %err,
                    "dropping undecodable datagram"
                );
                return;
            }
        };
        trace!(
            target = "peerlink::transport",
            peer = %self.config.id,
            frame = frame.name(),
            from = %datagram.from,
            "frame received"
        );
        match frame {
            Frame::Probe { ufrag, from_ufrag } => {
                let valid = ufrag == self.negotiator.local_ufrag()
                    && self.negotiator.remote_ufrag() == Some(from_ufrag.as_str());
                if !valid {
                    debug!(
                        target = "peerlink::transport",
                        peer = %self.config.id,
                        from = %datagram.from,
                        "ignoring probe with unknown credentials"
                    );
                    return;
                }
                if let Err(err) = self.send_to(&datagram.from, &Frame::ProbeAck { ufrag: from_ufrag }) {
                    debug!(target = "peerlink::transport", error = %err, "probe ack not sent");
                }
                self.on_path_validated(datagram.from);
            }
            Frame::ProbeAck { ufrag } => {
                if ufrag != self.negotiator.local_ufrag() || self.negotiator.remote_ufrag().is_none() {
                    debug!(
                        target = "peerlink::transport",
                        peer = %self.config.id,
                        "ignoring probe ack for another round"
                    );
                    return;
                }
                self.on_path_validated(datagram.from);
            }
            Frame::Data {
                stream,
                kind,
                fragment,
            } => self.on_data(stream, kind, fragment),
            other => {
                if self.remote_address.as_deref() != Some(datagram.from.as_str()) {
                    debug!(
                        target = "peerlink::transport",
                        peer = %self.config.id,
                        frame = other.name(),
                        "channel frame from unselected path"
                    );
                    return;
                }
                let effects = self.registry.on_frame(other);
                self.apply_effects(effects);
            }
        }
    }

    fn on_data(&mut self, stream: StreamId, kind: crate::router::PayloadKind, fragment: Fragment) {
        let bytes = match self.reassembler.ingest(stream, fragment) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(err) => {
                warn!(
                    target = "peerlink::transport",
                    peer = %self.config.id,
                    stream,
                    error = %err,
                    "dropping malformed payload"
                );
                self.emit(EndpointEvent::PayloadRejected {
                    stream,
                    error: TransportError::from(err).into(),
                });
                return;
            }
        };
        let Some(channel) = self.registry.inbound(stream).cloned() else {
            warn!(
                target = "peerlink::router",
                peer = %self.config.id,
                stream,
                "payload for unknown or closed channel"
            );
            self.emit(EndpointEvent::PayloadRejected {
                stream,
                error: SessionError::UnknownChannel(stream),
            });
            return;
        };
        if let Err(error) = self.router.dispatch(&channel, Payload { kind, bytes }) {
            self.emit(EndpointEvent::PayloadRejected { stream, error });
        }
    }

    fn on_path_validated(&mut self, address: String) {
        if self.remote_address.is_some() {
            return;
        }
        info!(
            target = "peerlink::transport",
            peer = %self.config.id,
            remote = %self.config.remote,
            path = %address,
            "connectivity established"
        );
        self.remote_address = Some(address);
        if self.state == EndpointState::Negotiating && self.negotiator.is_complete() {
            self.set_state(EndpointState::Connected);
        }
        let effects = self.registry.on_link_up();
        self.apply_effects(effects);
    }

    fn apply_effects(&mut self, effects: Vec<ChannelEffect>) {
        if effects.is_empty() {
            return;
        }
        for effect in effects {
            match effect {
                ChannelEffect::Send(frame) => {
                    if let Err(err) = self.send_frame(&frame) {
                        debug!(
                            target = "peerlink::channel",
                            peer = %self.config.id,
                            frame = frame.name(),
                            error = %err,
                            "channel frame not sent"
                        );
                    }
                }
                ChannelEffect::Notify(event) => {
                    if matches!(event, ChannelEvent::Closed(_) | ChannelEvent::Failed { .. }) {
                        self.reassembler.drop_stream(event.channel().stream);
                    }
                    self.emit(EndpointEvent::Channel(event));
                }
                ChannelEffect::ArmDeadline { stream, epoch } => {
                    let internal = self.internal.clone();
                    let wait = self.registry.open_timeout();
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        let _ = internal.send(Internal::Deadline { stream, epoch });
                    });
                }
            }
        }
        self.publish_channels();
    }

    fn publish_channels(&self) {
        self.channels_tx.send_replace(self.registry.list());
    }

    fn link_up(&self) -> bool {
        self.remote_address.is_some()
    }

    fn bind(&mut self) -> Result<(), SessionError> {
        self.unbind();
        let Binding {
            candidates,
            inbound,
            socket,
        } = self.network.bind(self.negotiator.local_ufrag())?;
        self.generation += 1;
        let generation = self.generation;
        let internal = self.internal.clone();
        let mut inbound = inbound;
        tokio::spawn(async move {
            while let Some(datagram) = inbound.recv().await {
                if internal
                    .send(Internal::Datagram {
                        generation,
                        datagram,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        debug!(
            target = "peerlink::transport",
            peer = %self.config.id,
            address = socket.local_address(),
            "socket bound"
        );
        self.local_candidates = candidates;
        self.socket = Some(socket);
        Ok(())
    }

    fn unbind(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
            debug!(
                target = "peerlink::transport",
                peer = %self.config.id,
                address = socket.local_address(),
                "socket released"
            );
        }
        self.generation += 1;
        self.remote_address = None;
        self.probed.clear();
        self.local_candidates.clear();
    }

    /// Trickles the bound socket's candidates back into the task. Only called
    /// once the local description has been advertised.
    fn start_gathering(&self) {
        let generation = self.generation;
        let gathered = self.local_candidates.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            for candidate in gathered {
                tokio::task::yield_now().await;
                let event = CandidateEvent::Candidate(candidate);
                if internal
                    .send(Internal::Gathered { generation, event })
                    .is_err()
                {
                    return;
                }
            }
            let _ = internal.send(Internal::Gathered {
                generation,
                event: CandidateEvent::EndOfCandidates,
            });
        });
    }

    fn probe_applied(&mut self) {
        let applied = self.candidates.applied().to_vec();
        for candidate in &applied {
            self.probe(candidate);
        }
    }

    fn probe(&mut self, candidate: &ConnectivityCandidate) {
        if self.socket.is_none() || self.link_up() || self.probed.contains(&candidate.address) {
            return;
        }
        let Some(remote_ufrag) = self.negotiator.remote_ufrag().map(str::to_string) else {
            return;
        };
        let frame = Frame::Probe {
            ufrag: remote_ufrag,
            from_ufrag: self.negotiator.local_ufrag().to_string(),
        };
        match self.send_to(&candidate.address, &frame) {
            Ok(()) => {
                self.probed.insert(candidate.address.clone());
                trace!(
                    target = "peerlink::transport",
                    peer = %self.config.id,
                    address = %candidate.address,
                    "probe sent"
                );
            }
            Err(err) => warn!(
                target = "peerlink::candidates",
                peer = %self.config.id,
                address = %candidate.address,
                error = %err,
                "candidate unreachable"
            ),
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let Some(address) = self.remote_address.as_deref() else {
            return Err(TransportError::ChannelClosed.into());
        };
        self.send_to(address, frame)
    }

    fn send_to(&self, address: &str, frame: &Frame) -> Result<(), SessionError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(TransportError::ChannelClosed.into());
        };
        let bytes = frame.encode().map_err(TransportError::from)?;
        socket.send_to(address, bytes)?;
        Ok(())
    }

    async fn advertise(
        &self,
        kind: SignalKind,
        description: &SessionDescription,
    ) -> Result<(), SessionError> {
        let message = SignalingMessage::new(self.config.id.clone(), kind, description.payload.clone());
        self.signal(message).await?;
        debug!(
            target = "peerlink::negotiation",
            peer = %self.config.id,
            kind = ?kind,
            round = description.version,
            "description advertised"
        );
        Ok(())
    }

    /// Sends one signal, giving up if the endpoint is closed meanwhile.
    async fn signal(&self, message: SignalingMessage) -> Result<(), SessionError> {
        let token = self.cancel.lock().clone();
        if token.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        tokio::select! {
            _ = token.cancelled() => Err(SessionError::Cancelled),
            sent = self.signaling.send(&self.config.remote, message) => sent.map_err(SessionError::from),
        }
    }

    fn set_state(&mut self, state: EndpointState) {
        if self.state == state {
            return;
        }
        debug!(
            target = "peerlink::session",
            peer = %self.config.id,
            from = ?self.state,
            to = ?state,
            "endpoint state changed"
        );
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(EndpointEvent::StateChanged(state));
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::PayloadKind;
    use crate::signaling::LocalSignaling;
    use crate::transport::LoopbackNetwork;
    use async_trait::async_trait;

    fn pair(auto_answer: bool) -> (EndpointHandle, EndpointHandle) {
        let signaling: Arc<dyn SignalingTransport> = Arc::new(LocalSignaling::new());
        let network: Arc<dyn Network> = Arc::new(LoopbackNetwork::new());
        let a_id = PeerId::new("a");
        let b_id = PeerId::new("b");
        let mut a_cfg = EndpointConfig::new(a_id.clone(), b_id.clone());
        a_cfg.auto_answer = auto_answer;
        let mut b_cfg = EndpointConfig::new(b_id, a_id);
        b_cfg.auto_answer = auto_answer;
        let a = EndpointHandle::spawn(a_cfg, Arc::clone(&signaling), Arc::clone(&network))
            .expect("spawn a");
        let b = EndpointHandle::spawn(b_cfg, signaling, network).expect("spawn b");
        (a, b)
    }

    #[tokio::test]
    async fn offer_answer_connects_both_endpoints() {
        let (a, b) = pair(true);
        a.attach_track(MediaTrack::video("cam")).await.expect("attach");
        let offer = a.create_offer().await.expect("offer");
        assert_eq!(offer.kind, DescriptionKind::Offer);
        a.wait_for_state(EndpointState::Connected).await.expect("a connected");
        b.wait_for_state(EndpointState::Connected).await.expect("b connected");

        let snapshot = b.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.role, Some(Role::Answerer));
        assert_eq!(snapshot.remote_tracks, vec![MediaTrack::video("cam")]);
        assert!(snapshot.selected_path.is_some());
        assert_eq!(
            a.attach_track(MediaTrack::audio("mic")).await,
            Err(SessionError::TrackAttach)
        );
    }

    #[tokio::test]
    async fn create_answer_without_offer_is_invalid() {
        let (_a, b) = pair(false);
        assert!(matches!(
            b.create_answer().await,
            Err(SessionError::InvalidState(_))
        ));
        assert_eq!(b.state(), EndpointState::New);
    }

    #[tokio::test]
    async fn manual_answer_and_repeat_apply_fails_endpoint() {
        let (a, b) = pair(false);
        let mut b_events = b.take_events().expect("events");
        let offer = a.create_offer().await.expect("offer");
        // b applies the offer from signaling on its own; wait for it.
        b.wait_for_state(EndpointState::Negotiating).await.expect("b negotiating");
        b.create_answer().await.expect("answer");

        let err = b.apply_remote_description(offer).await.unwrap_err();
        assert!(matches!(err, SessionError::NegotiationState(_)));
        assert_eq!(b.state(), EndpointState::Failed);
        let snapshot = b.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.failure.map(|e| e.kind()), Some(crate::ErrorKind::NegotiationState));

        let mut saw_failed = false;
        while let Ok(event) = b_events.try_recv() {
            saw_failed |= matches!(event, EndpointEvent::Failed(_));
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn channel_payloads_flow_after_connect() {
        let (a, b) = pair(true);
        for handle in [&a, &b] {
            handle
                .open_channel(ChannelSpec::negotiated("msg", 1, PayloadKind::Text))
                .await
                .expect("open msg");
        }
        a.create_offer().await.expect("offer");
        a.wait_for_channel(1, ChannelState::Open).await.expect("a open");
        b.wait_for_channel(1, ChannelState::Open).await.expect("b open");

        a.send_text(1, "hello").await.expect("send");
        let got = b.router().text_sink().recv().await.expect("payload");
        assert_eq!(got.as_text(), Some("hello"));
        assert_eq!(got.stream, 1);

        assert!(matches!(
            a.send_binary(1, vec![1u8]).await,
            Err(SessionError::ChannelKindViolation { .. })
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reopen_returns_to_new() {
        let (a, _b) = pair(true);
        a.open_channel(ChannelSpec::negotiated("msg", 1, PayloadKind::Text))
            .await
            .expect("open");
        a.close().await.expect("close");
        a.close().await.expect("close again");
        assert_eq!(a.state(), EndpointState::Closed);
        assert!(a.router().is_released());
        assert_eq!(
            a.open_channel(ChannelSpec::negotiated("msg", 1, PayloadKind::Text))
                .await,
            Err(SessionError::Closed)
        );

        a.reopen().await.expect("reopen");
        assert_eq!(a.state(), EndpointState::New);
        assert!(!a.router().is_released());
        assert!(a.snapshot().await.expect("snapshot").channels.is_empty());
    }

    /// Relays through [`LocalSignaling`] and records who sent which kind.
    #[derive(Clone, Default)]
    struct RecordingSignaling {
        inner: LocalSignaling,
        sent: Arc<Mutex<Vec<(PeerId, SignalKind)>>>,
    }

    impl RecordingSignaling {
        fn kinds_from(&self, peer: &PeerId) -> Vec<SignalKind> {
            self.sent
                .lock()
                .iter()
                .filter(|(from, _)| from == peer)
                .map(|(_, kind)| *kind)
                .collect()
        }
    }

    #[async_trait]
    impl SignalingTransport for RecordingSignaling {
        async fn send(&self, to: &PeerId, message: SignalingMessage) -> Result<(), TransportError> {
            self.sent.lock().push((message.from.clone(), message.kind));
            self.inner.send(to, message).await
        }

        fn subscribe(
            &self,
            peer: &PeerId,
        ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError> {
            self.inner.subscribe(peer)
        }
    }

    fn assert_description_first(kinds: &[SignalKind], description: SignalKind) {
        assert_eq!(kinds.first(), Some(&description), "{kinds:?}");
        assert_eq!(kinds.last(), Some(&SignalKind::EndOfCandidates), "{kinds:?}");
        assert_eq!(
            kinds.iter().filter(|kind| **kind == description).count(),
            1,
            "{kinds:?}"
        );
        assert!(
            kinds[1..kinds.len() - 1]
                .iter()
                .all(|kind| *kind == SignalKind::Candidate),
            "{kinds:?}"
        );
    }

    #[tokio::test]
    async fn descriptions_are_signaled_before_any_candidate() {
        let signaling = RecordingSignaling::default();
        let network: Arc<dyn Network> = Arc::new(LoopbackNetwork::new());
        let a_id = PeerId::new("a");
        let b_id = PeerId::new("b");
        let a = EndpointHandle::spawn(
            EndpointConfig::new(a_id.clone(), b_id.clone()),
            Arc::new(signaling.clone()),
            Arc::clone(&network),
        )
        .expect("spawn a");
        let b = EndpointHandle::spawn(
            EndpointConfig::new(b_id.clone(), a_id.clone()),
            Arc::new(signaling.clone()),
            network,
        )
        .expect("spawn b");

        a.create_offer().await.expect("offer");
        a.wait_for_state(EndpointState::Connected).await.expect("a connected");
        b.wait_for_state(EndpointState::Connected).await.expect("b connected");

        let gathered = |peer: &PeerId| {
            signaling.kinds_from(peer).last() == Some(&SignalKind::EndOfCandidates)
        };
        for _ in 0..100 {
            if gathered(&a_id) && gathered(&b_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_description_first(&signaling.kinds_from(&a_id), SignalKind::Offer);
        assert_description_first(&signaling.kinds_from(&b_id), SignalKind::Answer);
    }

    struct StalledSignaling;

    #[async_trait]
    impl SignalingTransport for StalledSignaling {
        async fn send(&self, _to: &PeerId, _message: SignalingMessage) -> Result<(), TransportError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn subscribe(
            &self,
            _peer: &PeerId,
        ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn close_cancels_in_flight_offer() {
        let a = EndpointHandle::spawn(
            EndpointConfig::new(PeerId::new("a"), PeerId::new("b")),
            Arc::new(StalledSignaling),
            Arc::new(LoopbackNetwork::new()),
        )
        .expect("spawn");
        let pending = {
            let a = a.clone();
            tokio::spawn(async move { a.create_offer().await })
        };
        tokio::task::yield_now().await;
        a.close().await.expect("close");
        let result = pending.await.expect("join");
        assert_eq!(result, Err(SessionError::Cancelled));
        assert_eq!(a.state(), EndpointState::Closed);
    }

    struct DownSignaling;

    #[async_trait]
    impl SignalingTransport for DownSignaling {
        async fn send(&self, _to: &PeerId, _message: SignalingMessage) -> Result<(), TransportError> {
            Err(TransportError::Signaling("relay unavailable".into()))
        }

        fn subscribe(
            &self,
            _peer: &PeerId,
        ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn signaling_failure_leaves_state_unchanged() {
        let network = LoopbackNetwork::new();
        let a = EndpointHandle::spawn(
            EndpointConfig::new(PeerId::new("a"), PeerId::new("b")),
            Arc::new(DownSignaling),
            Arc::new(network.clone()),
        )
        .expect("spawn");
        let err = a.create_offer().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Signaling(_))));
        assert_eq!(a.state(), EndpointState::New);
        assert_eq!(network.routes(), 0);
        let snapshot = a.snapshot().await.expect("snapshot");
        assert!(snapshot.local_description.is_none());
    }

    #[tokio::test]
    async fn self_pairing_is_rejected() {
        let err = EndpointHandle::spawn(
            EndpointConfig::new(PeerId::new("a"), PeerId::new("a")),
            Arc::new(LocalSignaling::new()),
            Arc::new(LoopbackNetwork::new()),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }
}
