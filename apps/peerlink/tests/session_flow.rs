use std::sync::Arc;
use std::time::Duration;

use peerlink_core::session::negotiation::Negotiator;
use peerlink_core::{
    CandidateEvent, CandidateOutcome, ChannelEvent, ChannelState, Config, ConnectivityCandidate,
    EndpointConfig, EndpointEvent, EndpointHandle, EndpointState, ErrorKind, LocalSignaling,
    LoopbackNetwork, PayloadKind, PeerId, Session, SessionError, SessionEvent, SessionState,
    TransportError,
};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

async fn connected_session(config: &Config) -> Session {
    let session = Session::loopback(config).expect("loopback session");
    session
        .open_pre_negotiated("msg", 1, PayloadKind::Text)
        .await
        .expect("open msg");
    session
        .open_pre_negotiated("img", 2, PayloadKind::Binary)
        .await
        .expect("open img");
    session.start().await.expect("start");
    session.wait_connected(None).await.expect("connected");
    for endpoint in session.endpoints() {
        for stream in [1, 2] {
            endpoint
                .wait_for_channel(stream, ChannelState::Open)
                .await
                .expect("channel open");
        }
    }
    session
}

fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[test_timeout::tokio_timeout_test]
async fn hello_reaches_the_text_sink_exactly_once() {
    init_tracing();
    let session = connected_session(&Config::default()).await;
    assert_eq!(session.state(), SessionState::Connected);

    let offerer = session.offerer();
    let answerer = session.answerer().expect("answerer");
    offerer.send_text(1, "hello").await.expect("send hello");

    let text = answerer.router().text_sink();
    let received = text.recv().await.expect("payload");
    assert_eq!(received.stream, 1);
    assert_eq!(received.channel_id, Some(1));
    assert_eq!(received.kind, PayloadKind::Text);
    assert_eq!(&received.bytes[..], b"hello");

    settle().await;
    assert!(text.try_recv().is_none());
    assert!(answerer.router().binary_sink().try_recv().is_none());
    assert_eq!(answerer.router().delivered(1), 1);
    assert_eq!(answerer.router().total_depth(), 0);

    session.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn repeated_remote_description_fails_the_session_until_restart() {
    init_tracing();
    let session = connected_session(&Config::default()).await;
    let offer = session
        .offerer()
        .snapshot()
        .await
        .expect("snapshot")
        .local_description
        .expect("offer held");
    let answerer = session.answerer().expect("answerer");

    let err = answerer
        .apply_remote_description(offer)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NegotiationState);
    session
        .wait_for_state(SessionState::Failed)
        .await
        .expect("session failed");
    assert_eq!(session.failure_kind(), Some(ErrorKind::NegotiationState));
    assert_eq!(answerer.state(), EndpointState::Failed);

    assert!(matches!(
        session.start().await,
        Err(SessionError::InvalidState(_))
    ));
    session.restart().await.expect("restart");
    session.wait_connected(None).await.expect("connected again");
    assert_eq!(session.failure(), None);
    let round = answerer.snapshot().await.expect("snapshot").round;
    assert_eq!(round, 2);

    session.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn early_candidates_are_queued_then_flushed_once() {
    init_tracing();
    let signaling = Arc::new(LocalSignaling::new());
    let network = Arc::new(LoopbackNetwork::new());
    let b = EndpointHandle::spawn(
        EndpointConfig::new(PeerId::new("b"), PeerId::new("a")),
        signaling,
        network,
    )
    .expect("spawn b");

    let mut remote = Negotiator::new();
    let offer = remote.create_offer(&[]).expect("offer");
    let candidate = |port: u16| {
        CandidateEvent::Candidate(ConnectivityCandidate {
            address: format!("loop://127.0.0.1:{port}"),
            ufrag: remote.local_ufrag().to_string(),
            priority: 1,
        })
    };

    assert_eq!(
        b.add_remote_candidate(candidate(1)).await,
        Err(SessionError::PrematureCandidate { queued: 1 })
    );
    assert_eq!(
        b.add_remote_candidate(candidate(2)).await,
        Err(SessionError::PrematureCandidate { queued: 2 })
    );
    assert_eq!(
        b.add_remote_candidate(candidate(1)).await,
        Err(SessionError::PrematureCandidate { queued: 2 })
    );
    assert_eq!(b.snapshot().await.expect("snapshot").pending_candidates, 2);

    b.apply_remote_description(offer).await.expect("apply offer");
    let snapshot = b.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.pending_candidates, 0);
    assert_eq!(snapshot.applied_candidates, 2);
    assert_eq!(snapshot.state, EndpointState::Negotiating);

    assert_eq!(
        b.add_remote_candidate(candidate(2)).await,
        Ok(CandidateOutcome::Duplicate)
    );
    assert_eq!(b.snapshot().await.expect("snapshot").applied_candidates, 2);
    b.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn close_is_idempotent_with_one_notification_per_channel() {
    init_tracing();
    let session = connected_session(&Config::default()).await;
    let mut events = session.take_events().expect("events");
    drain(&mut events);

    session.close().await.expect("close");
    session.close().await.expect("close again");
    assert_eq!(session.state(), SessionState::Closed);
    settle().await;

    let closed: Vec<(PeerId, u16)> = drain(&mut events)
        .into_iter()
        .filter_map(|tagged| match tagged.event {
            EndpointEvent::Channel(ChannelEvent::Closed(channel)) => {
                Some((tagged.endpoint, channel.stream))
            }
            _ => None,
        })
        .collect();
    assert_eq!(closed.len(), 4, "two channels on two endpoints: {closed:?}");
    for endpoint in session.endpoints() {
        for stream in [1, 2] {
            let count = closed
                .iter()
                .filter(|(id, s)| id == endpoint.id() && *s == stream)
                .count();
            assert_eq!(count, 1);
        }
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert!(endpoint.router().is_released());
        assert!(endpoint.router().text_sink().recv().await.is_none());
    }
    assert!(matches!(
        session.start().await,
        Err(SessionError::InvalidState(_))
    ));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn negotiation_deadline_reports_timeout() {
    init_tracing();
    // Nobody answers: the offer is retained for a peer that never subscribes.
    let offerer = EndpointHandle::spawn(
        EndpointConfig::new(PeerId::new("a"), PeerId::new("ghost")),
        Arc::new(LocalSignaling::new()),
        Arc::new(LoopbackNetwork::new()),
    )
    .expect("spawn");
    let session = Session::new(vec![offerer], Duration::from_secs(10)).expect("session");
    session.start().await.expect("start");

    let err = session
        .wait_connected(Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::NegotiationTimeout(Duration::from_millis(300)));
    assert_eq!(session.state(), SessionState::Negotiating);
    session.shutdown().await.expect("shutdown");
    assert_eq!(session.state(), SessionState::Closed);
}

#[test_timeout::tokio_timeout_test]
async fn signaling_failure_on_start_leaves_session_idle() {
    init_tracing();
    let signaling = Arc::new(LocalSignaling::new());
    let session = Session::loopback_with(
        &Config::default(),
        signaling.clone(),
        Arc::new(LoopbackNetwork::new()),
    )
    .expect("session");
    signaling.bus().close();

    let err = session.start().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Signaling(_))
    ));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.offerer().state(), EndpointState::New);
    session.shutdown().await.expect("shutdown");
}
