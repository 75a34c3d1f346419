//! Session lifecycle: composes endpoints, derives the session state from
//! theirs and owns teardown ordering.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelSpec, DataChannel};
use crate::config::Config;
use crate::error::{ErrorKind, SessionError};
use crate::router::PayloadKind;
use crate::signaling::{LocalSignaling, PeerId, SignalingTransport};
use crate::transport::{LoopbackNetwork, Network};

pub mod candidates;
pub mod endpoint;
pub mod negotiation;

use endpoint::{EndpointConfig, EndpointEvent, EndpointHandle, EndpointState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// An endpoint event tagged with the endpoint that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub endpoint: PeerId,
    pub event: EndpointEvent,
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    failure: Option<SessionError>,
}

struct Shared {
    status: Mutex<Status>,
    state_tx: watch::Sender<SessionState>,
}

impl Shared {
    /// Applies `next` if `allowed` accepts the current state.
    fn transition(
        &self,
        allowed: impl FnOnce(SessionState) -> bool,
        next: SessionState,
        failure: Option<SessionError>,
    ) -> bool {
        let mut status = self.status.lock();
        if !allowed(status.state) {
            return false;
        }
        debug!(
            target = "peerlink::session",
            from = ?status.state,
            to = ?next,
            "session state changed"
        );
        status.state = next;
        if failure.is_some() {
            status.failure = failure;
        }
        self.state_tx.send_replace(next);
        true
    }

    fn state(&self) -> SessionState {
        self.status.lock().state
    }
}

/// Top-level controller. The first endpoint is the offerer; a second one,
/// when present, is the in-process answerer.
pub struct Session {
    endpoints: Vec<EndpointHandle>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    negotiation_timeout: Duration,
}

impl Session {
    /// Wraps already spawned endpoints. Must be called from within a Tokio
    /// runtime; endpoint event streams are taken over by the session.
    pub fn new(endpoints: Vec<EndpointHandle>, negotiation_timeout: Duration) -> Result<Self, SessionError> {
        if endpoints.is_empty() {
            return Err(SessionError::InvalidState("a session needs an endpoint".into()));
        }
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: SessionState::Idle,
                failure: None,
            }),
            state_tx,
        });

        let (merged_tx, merged_rx) = mpsc::unbounded_channel();
        for handle in &endpoints {
            let Some(mut events) = handle.take_events() else {
                return Err(SessionError::InvalidState(format!(
                    "events of endpoint {} already taken",
                    handle.id()
                )));
            };
            let merged = merged_tx.clone();
            let endpoint = handle.id().clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let tagged = SessionEvent {
                        endpoint: endpoint.clone(),
                        event,
                    };
                    if merged.send(tagged).is_err() {
                        break;
                    }
                }
            });
        }
        drop(merged_tx);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(
            merged_rx,
            out_tx,
            endpoints.clone(),
            Arc::clone(&shared),
        ));

        Ok(Self {
            endpoints,
            shared,
            state_rx,
            events: Mutex::new(Some(out_rx)),
            pump: Mutex::new(Some(pump)),
            negotiation_timeout,
        })
    }

    /// Two endpoints in one process, wired through [`LocalSignaling`] and a
    /// [`LoopbackNetwork`].
    pub fn loopback(config: &Config) -> Result<Self, SessionError> {
        Self::loopback_with(
            config,
            Arc::new(LocalSignaling::new()),
            Arc::new(LoopbackNetwork::new()),
        )
    }

    pub fn loopback_with(
        config: &Config,
        signaling: Arc<dyn SignalingTransport>,
        network: Arc<dyn Network>,
    ) -> Result<Self, SessionError> {
        let offerer_id = PeerId::random();
        let answerer_id = PeerId::random();
        let offerer = EndpointHandle::spawn(
            config.endpoint_config(offerer_id.clone(), answerer_id.clone()),
            Arc::clone(&signaling),
            Arc::clone(&network),
        )?;
        let answerer_config = EndpointConfig {
            auto_answer: true,
            ..config.endpoint_config(answerer_id, offerer_id)
        };
        let answerer = EndpointHandle::spawn(answerer_config, signaling, network)?;
        Self::new(vec![offerer, answerer], config.negotiation_timeout)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Error that moved the session to `Failed`, if any.
    pub fn failure(&self) -> Option<SessionError> {
        self.shared.status.lock().failure.clone()
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.failure().map(|err| err.kind())
    }

    pub fn endpoints(&self) -> &[EndpointHandle] {
        &self.endpoints
    }

    pub fn offerer(&self) -> &EndpointHandle {
        &self.endpoints[0]
    }

    pub fn answerer(&self) -> Option<&EndpointHandle> {
        self.endpoints.get(1)
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().take()
    }

    /// Opens the same pre-negotiated channel on every endpoint.
    pub async fn open_pre_negotiated(
        &self,
        label: &str,
        id: u16,
        kind: PayloadKind,
    ) -> Result<Vec<DataChannel>, SessionError> {
        let mut opened = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            opened.push(
                endpoint
                    .open_channel(ChannelSpec::negotiated(label, id, kind))
                    .await?,
            );
        }
        Ok(opened)
    }

    /// Begins negotiation. Only valid while idle. A signaling failure leaves
    /// the session idle so `start` can be retried.
    pub async fn start(&self) -> Result<(), SessionError> {
        if !self.shared.transition(
            |state| state == SessionState::Idle,
            SessionState::Negotiating,
            None,
        ) {
            return Err(SessionError::InvalidState(format!(
                "cannot start a session that is {:?}",
                self.state()
            )));
        }
        info!(target = "peerlink::session", endpoints = self.endpoints.len(), "session starting");
        match self.offerer().create_offer().await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::Transport => {
                warn!(target = "peerlink::session", error = %err, "offer not delivered");
                self.shared.transition(
                    |state| state == SessionState::Negotiating,
                    SessionState::Idle,
                    None,
                );
                Err(err)
            }
            Err(err) => {
                self.shared.transition(
                    |state| !state.is_terminal() && state != SessionState::Closing,
                    SessionState::Failed,
                    Some(err.clone()),
                );
                Err(err)
            }
        }
    }

    /// Waits until every endpoint is connected. Gives up after `deadline`
    /// (or the configured negotiation timeout) with
    /// [`SessionError::NegotiationTimeout`]; the session itself is left as is.
    pub async fn wait_connected(&self, deadline: Option<Duration>) -> Result<(), SessionError> {
        let deadline = deadline.unwrap_or(self.negotiation_timeout);
        let mut state = self.state_rx.clone();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed => {
                        return Err(self.failure().unwrap_or(SessionError::Closed));
                    }
                    SessionState::Closing | SessionState::Closed => {
                        return Err(SessionError::Closed);
                    }
                    SessionState::Idle | SessionState::Negotiating => {}
                }
                if state.changed().await.is_err() {
                    return Err(SessionError::Closed);
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::NegotiationTimeout(deadline)),
        }
    }

    pub async fn wait_for_state(&self, target: SessionState) -> Result<(), SessionError> {
        let mut state = self.state_rx.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            state.changed().await.map_err(|_| SessionError::Closed)?;
        }
    }

    /// Tears the session down: every channel is closed (with notifications),
    /// then every endpoint, then the payload queues are released. Calling it
    /// again is a no-op. A failed session stays `Failed`, including one that
    /// fails while closing.
    pub async fn close(&self) -> Result<(), SessionError> {
        let was_failed = self.state() == SessionState::Failed;
        if !was_failed
            && !self.shared.transition(
                |state| !state.is_terminal() && state != SessionState::Closing,
                SessionState::Closing,
                None,
            )
        {
            return Ok(());
        }
        info!(target = "peerlink::session", "session closing");

        for endpoint in &self.endpoints {
            if let Err(err) = endpoint.close_channels().await {
                debug!(target = "peerlink::session", peer = %endpoint.id(), error = %err, "channels already gone");
            }
        }
        for endpoint in &self.endpoints {
            endpoint.teardown().await?;
        }
        for endpoint in &self.endpoints {
            endpoint.router().release();
        }

        if !was_failed {
            self.shared.transition(
                |state| state == SessionState::Closing,
                SessionState::Closed,
                None,
            );
        }
        Ok(())
    }

    /// Explicit recovery from `Failed`: endpoints are closed, reopened and a
    /// fresh round is started.
    pub async fn restart(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Failed {
            return Err(SessionError::InvalidState(format!(
                "only a failed session can restart, this one is {:?}",
                self.state()
            )));
        }
        info!(target = "peerlink::session", "session restarting");
        for endpoint in &self.endpoints {
            endpoint.teardown().await?;
            endpoint.reopen().await?;
        }
        {
            let mut status = self.shared.status.lock();
            status.state = SessionState::Idle;
            status.failure = None;
            self.shared.state_tx.send_replace(SessionState::Idle);
        }
        self.start().await
    }

    /// Closes the session and stops every endpoint task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.close().await?;
        for endpoint in &self.endpoints {
            endpoint.shutdown().await;
        }
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }
        Ok(())
    }
}

/// Derives the session state from endpoint events and republishes them.
async fn pump_events(
    mut merged: mpsc::UnboundedReceiver<SessionEvent>,
    out: mpsc::UnboundedSender<SessionEvent>,
    endpoints: Vec<EndpointHandle>,
    shared: Arc<Shared>,
) {
    while let Some(tagged) = merged.recv().await {
        match &tagged.event {
            EndpointEvent::StateChanged(EndpointState::Connected) => {
                let all_connected = endpoints
                    .iter()
                    .all(|endpoint| endpoint.state() == EndpointState::Connected);
                if all_connected
                    && shared.transition(
                        |state| state == SessionState::Negotiating,
                        SessionState::Connected,
                        None,
                    )
                {
                    info!(target = "peerlink::session", "session connected");
                }
            }
            EndpointEvent::Failed(error) => {
                if shared.transition(
                    |state| {
                        !state.is_terminal()
                    },
                    SessionState::Failed,
                    Some(error.clone()),
                ) {
                    warn!(
                        target = "peerlink::session",
                        peer = %tagged.endpoint,
                        error = %error,
                        "session failed"
                    );
                }
            }
            _ => {}
        }
        let _ = out.send(tagged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_in(state: SessionState) -> Arc<Shared> {
        let (state_tx, _) = watch::channel(state);
        Arc::new(Shared {
            status: Mutex::new(Status {
                state,
                failure: None,
            }),
            state_tx,
        })
    }

    async fn pump_one(shared: &Arc<Shared>, event: EndpointEvent) -> SessionEvent {
        let (merged_tx, merged_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let tagged = SessionEvent {
            endpoint: PeerId::new("a"),
            event,
        };
        merged_tx.send(tagged).expect("queue event");
        drop(merged_tx);
        pump_events(merged_rx, out_tx, Vec::new(), Arc::clone(shared)).await;
        out_rx.recv().await.expect("event forwarded")
    }

    #[tokio::test]
    async fn failure_while_closing_is_recorded() {
        let shared = shared_in(SessionState::Closing);
        let forwarded = pump_one(&shared, EndpointEvent::Failed(SessionError::Closed)).await;
        assert_eq!(forwarded.event, EndpointEvent::Failed(SessionError::Closed));
        assert_eq!(shared.state(), SessionState::Failed);
        assert_eq!(shared.status.lock().failure, Some(SessionError::Closed));
    }

    #[tokio::test]
    async fn terminal_states_absorb_failures() {
        let shared = shared_in(SessionState::Closed);
        pump_one(&shared, EndpointEvent::Failed(SessionError::Closed)).await;
        assert_eq!(shared.state(), SessionState::Closed);
        assert_eq!(shared.status.lock().failure, None);
    }
}
