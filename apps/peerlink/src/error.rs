use std::time::Duration;

use thiserror::Error;

use crate::channel::StreamId;
use crate::router::PayloadKind;
use crate::transport::TransportError;

/// Coarse discriminant of [`SessionError`], exposed by failed sessions and
/// endpoints so callers can branch without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NegotiationState,
    MalformedDescription,
    PrematureCandidate,
    ChannelAgreement,
    ChannelKindViolation,
    Transport,
    NegotiationTimeout,
    UnknownChannel,
    InvalidState,
    TrackAttach,
    Cancelled,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("negotiation state error: {0}")]
    NegotiationState(String),
    #[error("malformed session description: {0}")]
    MalformedDescription(String),
    #[error("candidate arrived before any remote description ({queued} queued)")]
    PrematureCandidate { queued: usize },
    #[error(
        "pre-negotiated channel {label:?} (id {id}) was not acknowledged by the peer within {waited:?}"
    )]
    ChannelAgreement {
        label: String,
        id: u16,
        waited: Duration,
    },
    #[error("channel {label:?} carries {expected} payloads, got {actual}")]
    ChannelKindViolation {
        label: String,
        expected: PayloadKind,
        actual: PayloadKind,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("negotiation did not complete within {0:?}")]
    NegotiationTimeout(Duration),
    #[error("unknown channel stream {0}")]
    UnknownChannel(StreamId),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("media tracks must be attached before negotiation starts")]
    TrackAttach,
    #[error("operation cancelled by endpoint close")]
    Cancelled,
    #[error("endpoint closed")]
    Closed,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NegotiationState(_) => ErrorKind::NegotiationState,
            SessionError::MalformedDescription(_) => ErrorKind::MalformedDescription,
            SessionError::PrematureCandidate { .. } => ErrorKind::PrematureCandidate,
            SessionError::ChannelAgreement { .. } => ErrorKind::ChannelAgreement,
            SessionError::ChannelKindViolation { .. } => ErrorKind::ChannelKindViolation,
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::NegotiationTimeout(_) => ErrorKind::NegotiationTimeout,
            SessionError::UnknownChannel(_) => ErrorKind::UnknownChannel,
            SessionError::InvalidState(_) => ErrorKind::InvalidState,
            SessionError::TrackAttach => ErrorKind::TrackAttach,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::Closed => ErrorKind::Closed,
        }
    }

    /// Errors the core absorbs on its own; the caller may log and move on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::PrematureCandidate { .. } | SessionError::ChannelKindViolation { .. }
        )
    }
}
