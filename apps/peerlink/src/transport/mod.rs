//! Network side of a session: connectivity candidates, datagram sockets and
//! the wire format used on an established path.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod chunk;
pub mod frame;
pub mod loopback;

pub use chunk::{ChunkConfig, ChunkError, Fragment, Reassembler};
pub use frame::{Frame, FrameError};
pub use loopback::LoopbackNetwork;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("signaling delivery failed: {0}")]
    Signaling(String),
    #[error("no route to {0}")]
    Unreachable(String),
    #[error("socket closed")]
    ChannelClosed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// One reachability path offered by an endpoint. The credential fragment
/// ties the candidate to the description round that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectivityCandidate {
    pub address: String,
    pub ufrag: String,
    pub priority: u32,
}

/// A candidate or the end-of-candidates sentinel for the current round.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CandidateEvent {
    Candidate(ConnectivityCandidate),
    EndOfCandidates,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: String,
    pub bytes: Bytes,
}

/// Sending half of a bound address. Implementations stop routing to the
/// address once closed or dropped.
pub trait DatagramSocket: Send + Sync {
    fn local_address(&self) -> &str;
    fn send_to(&self, to: &str, bytes: Bytes) -> Result<(), TransportError>;
    fn close(&self);
}

/// A bound local socket for one negotiation round.
pub struct Binding {
    pub candidates: Vec<ConnectivityCandidate>,
    pub inbound: mpsc::UnboundedReceiver<Datagram>,
    pub socket: Box<dyn DatagramSocket>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("address", &self.socket.local_address())
            .field("candidates", &self.candidates.len())
            .finish()
    }
}

/// Provides the underlying datagram paths an endpoint gathers candidates
/// from. Binding happens once per negotiation round with that round's local
/// credential fragment.
pub trait Network: Send + Sync {
    fn bind(&self, ufrag: &str) -> Result<Binding, TransportError>;
}
