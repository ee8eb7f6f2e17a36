//! Per-backend liveness probing with a cooldown window.

use std::time::{Duration, Instant};

use tracing::debug;

use super::conn::ConnectionCreator;

/// Observed liveness of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unknown,
    Online,
    Offline,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Unknown => write!(f, "unknown"),
            ServerState::Online => write!(f, "online"),
            ServerState::Offline => write!(f, "offline"),
        }
    }
}

/// Probes the upstream on demand and caches the verdict for `cooldown`.
///
/// OFFLINE sticks until the cooldown elapses so a dead upstream is not
/// redialed for every incoming request. The probe is a plain dial: no
/// PROXY header, no handshake.
#[derive(Debug)]
pub struct StateAgent {
    creator: ConnectionCreator,
    cooldown: Duration,
    state: ServerState,
    probed_at: Option<Instant>,
}

impl StateAgent {
    pub fn new(creator: ConnectionCreator, cooldown: Duration) -> Self {
        Self {
            creator,
            cooldown,
            state: ServerState::Unknown,
            probed_at: None,
        }
    }

    /// Current state, probing first if the cached verdict has decayed.
    /// A zero cooldown probes on every call.
    pub async fn state(&mut self) -> ServerState {
        let stale = match self.probed_at {
            None => true,
            Some(at) => at.elapsed() >= self.cooldown,
        };
        if stale || self.state == ServerState::Unknown {
            self.probe().await;
        }
        self.state
    }

    async fn probe(&mut self) {
        self.state = match self.creator.connect().await {
            Ok(_stream) => ServerState::Online,
            Err(err) => {
                debug!(target_addr = %self.creator.target(), error = %err, "liveness probe failed");
                ServerState::Offline
            }
        };
        self.probed_at = Some(Instant::now());
    }
}
