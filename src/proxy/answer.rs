//! Request/answer types exchanged between frontend and backend workers.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::mc::packets::{HandshakeState, ServerBoundHandshake};
use crate::mc::Packet;

use super::conn::UpstreamConnector;

/// Session lifecycle events a frontend sends to the owning backend worker
/// while it tunnels bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    Open,
    Close,
}

impl std::fmt::Display for ProxyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyEvent::Open => write!(f, "proxy open"),
            ProxyEvent::Close => write!(f, "proxy close"),
        }
    }
}

/// The unit a frontend sends to a backend worker.
#[derive(Debug)]
pub struct BackendRequest {
    pub kind: HandshakeState,
    pub handshake: ServerBoundHandshake,
    /// Normalized virtual hostname the client asked for.
    pub server_addr: String,
    /// Original client address (post PROXY-protocol rewrite, if any).
    pub client_addr: SocketAddr,
    /// Username from login start; empty for status requests.
    pub username: String,
    /// Single-use reply channel.
    pub reply: oneshot::Sender<ProcessAnswer>,
}

/// The decision a backend worker returns for one request.
///
/// The variants enforce the payload contract: a proxied session always has
/// a connector and an event channel, a synthesized reply always has its
/// packet.
#[derive(Debug)]
pub enum ProcessAnswer {
    /// Tunnel to the upstream: dial via `connector`, write both packets,
    /// then splice bytes. Session open/close is reported on `events`.
    Proxy {
        connector: UpstreamConnector,
        first_packet: Packet,
        second_packet: Packet,
        events: mpsc::Sender<ProxyEvent>,
    },
    /// Write the status packet, echo the client's ping, close.
    SendStatus {
        packet: Packet,
        latency: Option<Duration>,
    },
    /// Write the disconnect packet, close.
    Disconnect { packet: Packet },
    /// Close the socket without writing anything.
    Close,
}

impl ProcessAnswer {
    /// Action label for logs.
    pub fn action(&self) -> &'static str {
        match self {
            ProcessAnswer::Proxy { .. } => "proxy",
            ProcessAnswer::SendStatus { .. } => "send_status",
            ProcessAnswer::Disconnect { .. } => "disconnect",
            ProcessAnswer::Close => "close",
        }
    }
}
