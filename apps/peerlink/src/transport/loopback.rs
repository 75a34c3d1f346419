use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{Binding, ConnectivityCandidate, Datagram, DatagramSocket, Network, TransportError};

const HOST_PRIORITY: u32 = 2_130_706_431;
const RELAY_PRIORITY: u32 = 16_777_215;

/// In-process network. Each bind allocates a host address plus a relay alias
/// routed to the same inbound queue, so endpoints gather more than one
/// candidate per round. Delivery is FIFO per sender.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<LoopbackInner>,
}

#[derive(Default)]
struct LoopbackInner {
    routes: RwLock<HashMap<String, mpsc::UnboundedSender<Datagram>>>,
    next_port: AtomicU32,
    relay_disabled: AtomicBool,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only gather host candidates from now on.
    pub fn disable_relay(&self) {
        self.inner.relay_disabled.store(true, Ordering::SeqCst);
    }

    /// Number of addresses currently routable.
    pub fn routes(&self) -> usize {
        self.inner.routes.read().len()
    }
}

impl Network for LoopbackNetwork {
    fn bind(&self, ufrag: &str) -> Result<Binding, TransportError> {
        let port = 40_000 + self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let host = format!("loop://127.0.0.1:{port}");
        let mut addresses = vec![(host.clone(), HOST_PRIORITY)];
        if !self.inner.relay_disabled.load(Ordering::SeqCst) {
            addresses.push((format!("loop://relay/{port}"), RELAY_PRIORITY));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.inner.routes.write();
            for (address, _) in &addresses {
                routes.insert(address.clone(), tx.clone());
            }
        }
        tracing::debug!(
            target = "peerlink::transport",
            address = %host,
            ufrag,
            "loopback socket bound"
        );

        let candidates = addresses
            .iter()
            .map(|(address, priority)| ConnectivityCandidate {
                address: address.clone(),
                ufrag: ufrag.to_string(),
                priority: *priority,
            })
            .collect();
        let socket = LoopbackSocket {
            address: host,
            aliases: addresses.into_iter().map(|(address, _)| address).collect(),
            inner: Arc::clone(&self.inner),
        };
        Ok(Binding {
            candidates,
            inbound: rx,
            socket: Box::new(socket),
        })
    }
}

struct LoopbackSocket {
    address: String,
    aliases: Vec<String>,
    inner: Arc<LoopbackInner>,
}

impl DatagramSocket for LoopbackSocket {
    fn local_address(&self) -> &str {
        &self.address
    }

    fn send_to(&self, to: &str, bytes: Bytes) -> Result<(), TransportError> {
        let route = self.inner.routes.read().get(to).cloned();
        let Some(route) = route else {
            return Err(TransportError::Unreachable(to.to_string()));
        };
        route
            .send(Datagram {
                from: self.address.clone(),
                bytes,
            })
            .map_err(|_| TransportError::Unreachable(to.to_string()))
    }

    fn close(&self) {
        let mut routes = self.inner.routes.write();
        for alias in &self.aliases {
            routes.remove(alias);
        }
    }
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        self.close();
    }
}
