pub mod channel;
pub mod config;
pub mod error;
pub mod media;
pub mod router;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use channel::{ChannelEvent, ChannelMode, ChannelSpec, ChannelState, DataChannel, StreamId};
pub use config::Config;
pub use error::{ErrorKind, SessionError};
pub use media::{MediaTrack, TrackKind};
pub use router::{Payload, PayloadKind, PayloadRouter, PayloadSink, ReceivedPayload};
pub use session::candidates::CandidateOutcome;
pub use session::endpoint::{
    EndpointConfig, EndpointEvent, EndpointHandle, EndpointSnapshot, EndpointState, Role,
};
pub use session::negotiation::{DescriptionKind, SessionDescription};
pub use session::{Session, SessionEvent, SessionState};
pub use signaling::{LocalSignaling, PeerId, SignalKind, SignalingMessage, SignalingTransport};
pub use transport::{
    CandidateEvent, ConnectivityCandidate, LoopbackNetwork, Network, TransportError,
};
