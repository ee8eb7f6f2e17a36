//! Per-backend admission policy.
//!
//! Two implementations: [`AlwaysAllow`] for backends with no rate limit,
//! and [`BotFilter`], a sliding window over a time duration with a
//! temporary deny list for addresses caught in a burst.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::info;

use crate::mc::packets::HandshakeState;
use crate::mc::Packet;

use super::answer::{BackendRequest, ProcessAnswer};

/// Admission decision point, consulted by the backend worker before it
/// builds a proxy answer.
pub trait ConnectionLimiter: Send {
    /// `None` admits the request; `Some` carries the refusal to return.
    fn allow(&mut self, req: &BackendRequest) -> Option<ProcessAnswer>;
}

/// Admits everything. Installed when `rateLimit` is 0.
#[derive(Debug, Default)]
pub struct AlwaysAllow;

impl ConnectionLimiter for AlwaysAllow {
    fn allow(&mut self, _req: &BackendRequest) -> Option<ProcessAnswer> {
        None
    }
}

/// Sliding-window rate limiter with a temporary deny list.
///
/// Every admitted request lands in the window; entries older than the
/// window duration are evicted on the way in. When the window overflows,
/// the most recent distinct source addresses are put on the deny list
/// until `ban_cooldown` passes. Status floods are cut with a bare close,
/// login attempts get the configured reconnect message so a real player
/// knows to retry.
pub struct BotFilter {
    rate_limit: usize,
    window: Duration,
    ban_cooldown: Duration,
    disconnect_packet: Packet,

    entries: VecDeque<(Instant, IpAddr)>,
    deny_list: HashMap<IpAddr, Instant>,
}

impl BotFilter {
    pub fn new(
        rate_limit: usize,
        window: Duration,
        ban_cooldown: Duration,
        disconnect_packet: Packet,
    ) -> Self {
        Self {
            rate_limit,
            window,
            ban_cooldown,
            disconnect_packet,
            entries: VecDeque::new(),
            deny_list: HashMap::new(),
        }
    }

    fn refuse(&self, kind: HandshakeState) -> ProcessAnswer {
        match kind {
            HandshakeState::Status => ProcessAnswer::Close,
            _ => ProcessAnswer::Disconnect {
                packet: self.disconnect_packet.clone(),
            },
        }
    }
}

impl ConnectionLimiter for BotFilter {
    fn allow(&mut self, req: &BackendRequest) -> Option<ProcessAnswer> {
        let now = Instant::now();
        let ip = req.client_addr.ip();

        let cooldown = self.ban_cooldown;
        self.deny_list
            .retain(|_, banned_at| now.duration_since(*banned_at) < cooldown);
        if self.deny_list.contains_key(&ip) {
            return Some(self.refuse(req.kind));
        }

        self.entries.push_back((now, ip));
        while let Some((at, _)) = self.entries.front() {
            if now.duration_since(*at) >= self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }

        if self.entries.len() <= self.rate_limit {
            return None;
        }

        // Over the limit: ban the most recent distinct offenders.
        let mut banned = 0;
        for (_, offender) in self.entries.iter().rev() {
            if banned >= self.rate_limit {
                break;
            }
            if self.deny_list.insert(*offender, now).is_none() {
                banned += 1;
            }
        }
        info!(
            window_len = self.entries.len(),
            banned, "rate limit exceeded, source addresses banned"
        );
        Some(self.refuse(req.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc::packets::{ClientBoundDisconnect, ServerBoundHandshake};
    use tokio::sync::oneshot;

    fn request(kind: HandshakeState, addr: &str) -> BackendRequest {
        let (reply, _rx) = oneshot::channel();
        BackendRequest {
            kind,
            handshake: ServerBoundHandshake {
                protocol_version: 755,
                server_address: "uv".to_string(),
                server_port: 25565,
                next_state: if kind == HandshakeState::Login { 2 } else { 1 },
            },
            server_addr: "uv".to_string(),
            client_addr: addr.parse().unwrap(),
            username: String::new(),
            reply,
        }
    }

    fn filter(limit: usize, window: Duration, ban: Duration) -> BotFilter {
        BotFilter::new(
            limit,
            window,
            ban,
            ClientBoundDisconnect {
                reason: "slow down".to_string(),
            }
            .marshal(),
        )
    }

    #[test]
    fn always_allow_admits_everything() {
        let mut limiter = AlwaysAllow;
        for _ in 0..100 {
            assert!(limiter
                .allow(&request(HandshakeState::Login, "127.0.0.1:1000"))
                .is_none());
        }
    }

    #[test]
    fn second_login_within_window_is_disconnected() {
        let mut limiter = filter(1, Duration::from_secs(1), Duration::from_secs(60));
        assert!(limiter
            .allow(&request(HandshakeState::Login, "127.0.0.1:1000"))
            .is_none());
        let refusal = limiter
            .allow(&request(HandshakeState::Login, "127.0.0.1:1001"))
            .expect("second request refused");
        match refusal {
            ProcessAnswer::Disconnect { packet } => {
                let dc = ClientBoundDisconnect::unmarshal(&packet).unwrap();
                assert_eq!(dc.reason, "slow down");
            }
            other => panic!("expected disconnect, got {}", other.action()),
        }
    }

    #[test]
    fn status_flood_is_closed_not_disconnected() {
        let mut limiter = filter(1, Duration::from_secs(1), Duration::from_secs(60));
        assert!(limiter
            .allow(&request(HandshakeState::Status, "127.0.0.1:1000"))
            .is_none());
        let refusal = limiter
            .allow(&request(HandshakeState::Status, "127.0.0.1:1001"))
            .unwrap();
        assert!(matches!(refusal, ProcessAnswer::Close));
    }

    #[test]
    fn banned_address_stays_refused_until_cooldown() {
        let mut limiter = filter(1, Duration::from_millis(20), Duration::from_millis(60));
        limiter.allow(&request(HandshakeState::Login, "127.0.0.1:1000"));
        assert!(limiter
            .allow(&request(HandshakeState::Login, "127.0.0.1:1001"))
            .is_some());

        // Window has drained but the ban holds.
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter
            .allow(&request(HandshakeState::Login, "127.0.0.1:1002"))
            .is_some());

        // Ban expires after its own cooldown.
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter
            .allow(&request(HandshakeState::Login, "127.0.0.1:1003"))
            .is_none());
    }

    #[test]
    fn distinct_addresses_within_limit_pass() {
        let mut limiter = filter(3, Duration::from_secs(1), Duration::from_secs(60));
        for port in 0..3 {
            assert!(limiter
                .allow(&request(
                    HandshakeState::Login,
                    &format!("10.0.0.{port}:2500")
                ))
                .is_none());
        }
        assert!(limiter
            .allow(&request(HandshakeState::Login, "10.0.0.9:2500"))
            .is_some());
    }
}
