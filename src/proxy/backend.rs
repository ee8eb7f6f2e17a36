//! Backend workers.
//!
//! One task per configured backend owns all of that backend's mutable
//! state: liveness, status cache, rate limiter, and the active-connection
//! count. The task processes one event at a time off its channels, so
//! "updates apply between requests" holds by construction. Slow work
//! (probing, cache refresh) blocks only this backend, never its siblings.

use metrics::gauge;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::mc::packets::{HandshakeState, ServerBoundRequest, ServerLoginStart};
use crate::mc::Packet;

use super::answer::{BackendRequest, ProcessAnswer, ProxyEvent};
use super::conn::{ConnectionCreator, UpstreamConnector};
use super::limiter::{AlwaysAllow, BotFilter, ConnectionLimiter};
use super::realip::HandshakeModifier;
use super::state::{ServerState, StateAgent};
use super::status_cache::StatusCache;

/// Gauge tracking proxied sessions per backend.
pub const CONNECTED_GAUGE: &str = "ultraviolet_connected";

/// Mailbox capacity for requests; accept pressure backs up to the frontend.
const REQUEST_CHANNEL_CAPACITY: usize = 5;

/// Proxy events are buffered so session teardown never blocks on the worker.
const PROXY_EVENT_CHANNEL_CAPACITY: usize = 10;

/// Sparse configuration update. `Some` replaces the worker's current value,
/// `None` keeps it; reload diffs ship only what changed.
#[derive(Default)]
pub struct BackendWorkerUpdate {
    pub name: Option<String>,
    pub send_proxy_protocol: Option<bool>,
    pub offline_status: Option<Packet>,
    pub offline_disconnect: Option<Packet>,
    pub conn_creator: Option<ConnectionCreator>,
    pub hs_modifier: Option<Box<dyn HandshakeModifier + Send>>,
    pub conn_limiter: Option<Box<dyn ConnectionLimiter + Send>>,
    pub server_state: Option<StateAgent>,
    pub status_cache: Option<StatusCache>,
}

/// Channel set the worker task consumes.
pub struct BackendWorkerChannels {
    pub request_rx: mpsc::Receiver<BackendRequest>,
    pub proxy_event_rx: mpsc::Receiver<ProxyEvent>,
    pub conn_check_rx: mpsc::Receiver<oneshot::Sender<bool>>,
    pub update_rx: mpsc::Receiver<BackendWorkerUpdate>,
    pub close_rx: watch::Receiver<bool>,
}

/// Sender half handed to frontends and the manager.
#[derive(Clone)]
pub struct BackendSenders {
    pub request_tx: mpsc::Sender<BackendRequest>,
    pub proxy_event_tx: mpsc::Sender<ProxyEvent>,
    pub conn_check_tx: mpsc::Sender<oneshot::Sender<bool>>,
    pub update_tx: mpsc::Sender<BackendWorkerUpdate>,
}

pub fn backend_channels() -> (BackendSenders, watch::Sender<bool>, BackendWorkerChannels) {
    let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
    let (proxy_event_tx, proxy_event_rx) = mpsc::channel(PROXY_EVENT_CHANNEL_CAPACITY);
    let (conn_check_tx, conn_check_rx) = mpsc::channel(1);
    let (update_tx, update_rx) = mpsc::channel(1);
    let (close_tx, close_rx) = watch::channel(false);

    (
        BackendSenders {
            request_tx,
            proxy_event_tx,
            conn_check_tx,
            update_tx,
        },
        close_tx,
        BackendWorkerChannels {
            request_rx,
            proxy_event_rx,
            conn_check_rx,
            update_rx,
            close_rx,
        },
    )
}

/// Single-owner state machine for one backend.
pub struct BackendWorker {
    name: String,
    send_proxy_protocol: bool,
    offline_status: Packet,
    offline_disconnect: Packet,

    conn_creator: ConnectionCreator,
    hs_modifier: Option<Box<dyn HandshakeModifier + Send>>,
    conn_limiter: Box<dyn ConnectionLimiter + Send>,
    server_state: Option<StateAgent>,
    status_cache: Option<StatusCache>,

    active_conns: u64,
    proxy_event_tx: mpsc::Sender<ProxyEvent>,
}

impl BackendWorker {
    /// Assemble a worker from a resolved backend config.
    pub fn from_config(cfg: BackendConfig, proxy_event_tx: mpsc::Sender<ProxyEvent>) -> Self {
        let creator = ConnectionCreator::new(cfg.target, cfg.bind, cfg.dial_timeout);

        let conn_limiter: Box<dyn ConnectionLimiter + Send> = if cfg.rate_limit > 0 {
            Box::new(BotFilter::new(
                cfg.rate_limit,
                cfg.rate_cooldown,
                cfg.ban_list_cooldown,
                cfg.rate_disconnect,
            ))
        } else {
            Box::new(AlwaysAllow)
        };

        let status_cache = cfg.cache_status.then(|| {
            StatusCache::new(
                creator.clone(),
                cfg.cache_update_cooldown,
                cfg.valid_protocol,
                cfg.proxy_to.clone(),
                cfg.dial_timeout,
            )
        });

        Self {
            name: cfg.name,
            send_proxy_protocol: cfg.send_proxy_protocol,
            offline_status: cfg.offline_status,
            offline_disconnect: cfg.offline_disconnect,
            hs_modifier: cfg.real_ip.into_modifier(),
            conn_limiter,
            server_state: Some(StateAgent::new(creator.clone(), cfg.state_update_cooldown)),
            status_cache,
            conn_creator: creator,
            active_conns: 0,
            proxy_event_tx,
        }
    }

    /// Build the sparse update corresponding to a changed config. Every
    /// field is populated; sparseness matters when a caller hand-builds a
    /// narrower diff.
    pub fn update_from_config(cfg: BackendConfig) -> BackendWorkerUpdate {
        let creator = ConnectionCreator::new(cfg.target, cfg.bind, cfg.dial_timeout);
        let conn_limiter: Box<dyn ConnectionLimiter + Send> = if cfg.rate_limit > 0 {
            Box::new(BotFilter::new(
                cfg.rate_limit,
                cfg.rate_cooldown,
                cfg.ban_list_cooldown,
                cfg.rate_disconnect,
            ))
        } else {
            Box::new(AlwaysAllow)
        };
        let status_cache = cfg.cache_status.then(|| {
            StatusCache::new(
                creator.clone(),
                cfg.cache_update_cooldown,
                cfg.valid_protocol,
                cfg.proxy_to.clone(),
                cfg.dial_timeout,
            )
        });

        BackendWorkerUpdate {
            name: Some(cfg.name),
            send_proxy_protocol: Some(cfg.send_proxy_protocol),
            offline_status: Some(cfg.offline_status),
            offline_disconnect: Some(cfg.offline_disconnect),
            hs_modifier: cfg.real_ip.into_modifier(),
            conn_limiter: Some(conn_limiter),
            server_state: Some(StateAgent::new(creator.clone(), cfg.state_update_cooldown)),
            status_cache,
            conn_creator: Some(creator),
        }
    }

    /// Main loop. Runs until closed, then drains proxy events so the
    /// active-connection count can reach zero before teardown.
    pub async fn run(mut self, mut ch: BackendWorkerChannels) {
        // Warm the status cache so the first user request is not the one
        // paying for the round-trip.
        if let Some(cache) = &mut self.status_cache {
            if let Err(err) = cache.status().await.map(|_| ()) {
                debug!(host = %self.name, error = %err, "status cache warm-up failed");
            }
        }

        loop {
            tokio::select! {
                biased;

                changed = ch.close_rx.changed() => {
                    match changed {
                        Ok(()) if *ch.close_rx.borrow() => break,
                        Ok(()) => {}
                        // Manager gone entirely; shut down.
                        Err(_) => break,
                    }
                }

                Some(event) = ch.proxy_event_rx.recv() => {
                    self.handle_proxy_event(event);
                }

                Some(reply) = ch.conn_check_rx.recv() => {
                    let _ = reply.send(self.active_conns > 0);
                }

                Some(update) = ch.update_rx.recv() => {
                    self.apply_update(update);
                }

                Some(req) = ch.request_rx.recv() => {
                    let answer = self.handle_request(&req).await;
                    debug!(
                        host = %self.name,
                        client_addr = %req.client_addr,
                        kind = %req.kind,
                        action = answer.action(),
                        "request handled"
                    );
                    let _ = req.reply.send(answer);
                }
            }
        }

        // Closed: refuse new requests, let in-flight sessions drain.
        drop(ch.request_rx);
        drop(ch.update_rx);
        info!(host = %self.name, active = self.active_conns, "backend worker closing");
        while self.active_conns > 0 {
            tokio::select! {
                Some(event) = ch.proxy_event_rx.recv() => self.handle_proxy_event(event),
                Some(reply) = ch.conn_check_rx.recv() => {
                    let _ = reply.send(self.active_conns > 0);
                }
                else => break,
            }
        }
        info!(host = %self.name, "backend worker stopped");
    }

    fn handle_proxy_event(&mut self, event: ProxyEvent) {
        match event {
            ProxyEvent::Open => {
                self.active_conns += 1;
                gauge!(CONNECTED_GAUGE, "host" => self.name.clone()).increment(1.0);
            }
            ProxyEvent::Close => {
                if self.active_conns == 0 {
                    warn!(host = %self.name, "proxy close without matching open");
                    return;
                }
                self.active_conns -= 1;
                gauge!(CONNECTED_GAUGE, "host" => self.name.clone()).decrement(1.0);
            }
        }
    }

    /// Apply a sparse update: populated fields replace, absent fields keep.
    fn apply_update(&mut self, update: BackendWorkerUpdate) {
        if let Some(name) = update.name {
            if !name.is_empty() && name != self.name {
                // Move the gauge value to the new label.
                gauge!(CONNECTED_GAUGE, "host" => self.name.clone())
                    .decrement(self.active_conns as f64);
                gauge!(CONNECTED_GAUGE, "host" => name.clone())
                    .increment(self.active_conns as f64);
                self.name = name;
            }
        }
        if let Some(send) = update.send_proxy_protocol {
            self.send_proxy_protocol = send;
        }
        if let Some(pk) = update.offline_status {
            if !pk.data.is_empty() {
                self.offline_status = pk;
            }
        }
        if let Some(pk) = update.offline_disconnect {
            if !pk.data.is_empty() {
                self.offline_disconnect = pk;
            }
        }
        if let Some(modifier) = update.hs_modifier {
            self.hs_modifier = Some(modifier);
        }
        if let Some(creator) = update.conn_creator {
            self.conn_creator = creator;
        }
        if let Some(limiter) = update.conn_limiter {
            self.conn_limiter = limiter;
        }
        if let Some(state) = update.server_state {
            self.server_state = Some(state);
        }
        if let Some(cache) = update.status_cache {
            self.status_cache = Some(cache);
        }
        debug!(host = %self.name, "backend worker config updated");
    }

    /// Decide what to do with one request.
    ///
    /// Offline state dominates cache and limiter; the cache dominates the
    /// limiter because a cached reply costs no upstream resource.
    pub async fn handle_request(&mut self, req: &BackendRequest) -> ProcessAnswer {
        if let Some(state) = &mut self.server_state {
            if state.state().await == ServerState::Offline {
                match req.kind {
                    HandshakeState::Status => {
                        return ProcessAnswer::SendStatus {
                            packet: self.offline_status.clone(),
                            latency: None,
                        }
                    }
                    HandshakeState::Login => {
                        return ProcessAnswer::Disconnect {
                            packet: self.offline_disconnect.clone(),
                        }
                    }
                    HandshakeState::Unknown => {}
                }
            }
        }

        if req.kind == HandshakeState::Status {
            if let Some(cache) = &mut self.status_cache {
                return match cache.status().await {
                    Ok((packet, latency)) => ProcessAnswer::SendStatus {
                        packet,
                        latency: Some(latency),
                    },
                    Err(err) => {
                        debug!(host = %self.name, error = %err, "status refresh failed");
                        ProcessAnswer::SendStatus {
                            packet: self.offline_status.clone(),
                            latency: None,
                        }
                    }
                };
            }
        }

        if let Some(refusal) = self.conn_limiter.allow(req) {
            return refusal;
        }

        let mut handshake = req.handshake.clone();
        if let Some(modifier) = &self.hs_modifier {
            modifier.modify(&mut handshake, req.client_addr);
        }

        let connector = UpstreamConnector::new(
            self.conn_creator.clone(),
            req.client_addr,
            self.send_proxy_protocol,
        );
        let second_packet = match req.kind {
            HandshakeState::Login => ServerLoginStart {
                name: req.username.clone(),
            }
            .marshal(),
            _ => ServerBoundRequest.marshal(),
        };

        ProcessAnswer::Proxy {
            connector,
            first_packet: handshake.marshal(),
            second_packet,
            events: self.proxy_event_tx.clone(),
        }
    }
}
