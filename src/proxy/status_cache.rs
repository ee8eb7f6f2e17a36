//! Cached server-list status replies.
//!
//! Instead of paying a full status round-trip per client, the cache
//! performs one against the real upstream and serves the captured response
//! packet until the refresh cooldown elapses. The wall time of the
//! round-trip is retained so the frontend can present a realistic ping.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::mc::packets::{ServerBoundHandshake, ServerBoundRequest, STATUS_RESPONSE_ID};
use crate::mc::{McConn, Packet, ProtocolError};

use super::conn::ConnectionCreator;

#[derive(Debug, Clone)]
struct CachedStatus {
    packet: Packet,
    latency: Duration,
}

/// Per-backend status cache. Owned by the backend worker, so at most one
/// refresh is ever in flight per backend.
#[derive(Debug)]
pub struct StatusCache {
    creator: ConnectionCreator,
    cooldown: Duration,
    /// Protocol version to advertise in the refresh handshake.
    protocol: i32,
    /// Hostname to advertise in the refresh handshake.
    server_address: String,
    io_deadline: Duration,
    cached: Option<CachedStatus>,
    filled_at: Option<Instant>,
}

impl StatusCache {
    pub fn new(
        creator: ConnectionCreator,
        cooldown: Duration,
        protocol: i32,
        server_address: String,
        io_deadline: Duration,
    ) -> Self {
        Self {
            creator,
            cooldown,
            protocol,
            server_address,
            io_deadline,
            cached: None,
            filled_at: None,
        }
    }

    /// The cached status packet and its measured latency, refreshing first
    /// when the cooldown has elapsed. A failed refresh is an error so the
    /// caller can fall back to the offline status.
    pub async fn status(&mut self) -> Result<(Packet, Duration), ProtocolError> {
        let stale = match self.filled_at {
            None => true,
            Some(at) => at.elapsed() >= self.cooldown,
        };
        if stale {
            self.refresh().await?;
        }
        let cached = self.cached.as_ref().ok_or(ProtocolError::Truncated)?;
        Ok((cached.packet.clone(), cached.latency))
    }

    /// Full status round-trip: handshake with NextState=1, empty request,
    /// one response packet, wall time measured.
    async fn refresh(&mut self) -> Result<(), ProtocolError> {
        let started = Instant::now();
        let stream = self.creator.connect().await?;
        let mut conn = McConn::new(stream, self.io_deadline);

        let handshake = ServerBoundHandshake {
            protocol_version: self.protocol,
            server_address: self.server_address.clone(),
            server_port: self.creator.target().port(),
            next_state: 1,
        };
        conn.write_packet(&handshake.marshal()).await?;
        conn.write_packet(&ServerBoundRequest.marshal()).await?;

        let packet = conn.read_packet().await?;
        if packet.id != STATUS_RESPONSE_ID {
            return Err(ProtocolError::UnexpectedPacketId {
                expected: STATUS_RESPONSE_ID,
                actual: packet.id,
            });
        }
        let latency = started.elapsed();

        debug!(
            target_addr = %self.creator.target(),
            latency_ms = latency.as_millis() as u64,
            "status cache refreshed"
        );
        self.cached = Some(CachedStatus { packet, latency });
        self.filled_at = Some(Instant::now());
        Ok(())
    }
}
