//! Ultraviolet: a domain-aware reverse proxy for the Minecraft Java
//! Edition wire protocol.
//!
//! A single ingress endpoint accepts client connections, reads the opening
//! handshake, and routes each connection to a configured upstream by the
//! virtual hostname the client asked for. Per backend the proxy decides,
//! from liveness, cache, and rate-limit state, whether to tunnel bytes,
//! synthesize a status reply, refuse the login with a message, or close
//! the socket. Configuration is reloaded in place over HTTP without
//! dropping sessions in flight.

pub mod admin;
pub mod config;
pub mod mc;
pub mod proxy;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ServerConfig, UltravioletConfig};
use crate::proxy::listener::WORK_CHANNEL_CAPACITY;
use crate::proxy::{BackendManager, FrontendWorker, RoutingTable};

/// How often graceful shutdown re-checks for open sessions.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// A running proxy: listener, accept loops, frontend workers, and backend
/// manager. Used both by `main` and by integration tests.
pub struct ProxyHandle {
    pub local_addr: std::net::SocketAddr,
    pub manager: Arc<Mutex<BackendManager>>,
    pub table: Arc<RoutingTable>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
    /// Stop accepting and serving new connections. Sessions already
    /// spliced keep running on their own tasks.
    pub fn stop_accepting(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.stop_accepting();
    }
}

/// Bind the listener and spawn the worker topology.
pub async fn spawn_proxy(
    cfg: &UltravioletConfig,
    server_cfgs: Vec<ServerConfig>,
) -> anyhow::Result<ProxyHandle> {
    let listener: Arc<TcpListener> = Arc::new(
        proxy::listener::bind(&cfg.listen_addr())
            .await
            .with_context(|| format!("listen on {}", cfg.listen_addr()))?,
    );
    let local_addr = listener.local_addr()?;

    let table = Arc::new(RoutingTable::new());
    let mut manager = BackendManager::new(Arc::clone(&table));
    manager.load_all(server_cfgs).await;
    let manager = Arc::new(Mutex::new(manager));

    let (work_tx, work_rx) = mpsc::channel(WORK_CHANNEL_CAPACITY);
    let mut tasks = proxy::listener::spawn_accept_loops(
        listener,
        cfg.number_of_listeners,
        cfg.accept_proxy_protocol,
        work_tx,
    );
    info!(listeners = cfg.number_of_listeners.max(1), "accept loops running");

    let work_rx = Arc::new(Mutex::new(work_rx));
    let default_status = cfg.default_status.marshal();
    let io_deadline = cfg.io_deadline();
    for _ in 0..cfg.number_of_workers.max(1) {
        let worker = FrontendWorker::new(
            Arc::clone(&work_rx),
            Arc::clone(&table),
            default_status.clone(),
            io_deadline,
        );
        tasks.push(tokio::spawn(worker.run()));
    }
    info!(workers = cfg.number_of_workers.max(1), "frontend workers running");

    Ok(ProxyHandle {
        local_addr,
        manager,
        table,
        tasks,
    })
}

/// Run until interrupted, then drain gracefully: stop accepting, close the
/// backend workers, and wait for every open session to end. Sessions are
/// never forcibly cancelled.
pub async fn run(
    cfg: UltravioletConfig,
    server_cfgs: Vec<ServerConfig>,
    config_dir: &Path,
) -> anyhow::Result<()> {
    let prometheus = if cfg.enable_prometheus {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .install_recorder()
            .context("install prometheus recorder")?;
        Some(handle)
    } else {
        None
    };

    if cfg.enable_hot_swap {
        info!(
            pid_file = %cfg.pid_file,
            "listener handoff is not supported; config hot reload stays available via /reload"
        );
    }

    let mut handle = spawn_proxy(&cfg, server_cfgs).await?;

    if !cfg.prometheus_bind.is_empty() {
        let admin_state = admin::AdminState {
            manager: Arc::clone(&handle.manager),
            config_dir: config_dir.to_path_buf(),
            prometheus,
        };
        let bind = cfg.prometheus_addr();
        tokio::spawn(async move {
            if let Err(err) = admin::serve(bind, admin_state).await {
                tracing::error!(error = %err, "admin http server failed");
            }
        });
    }

    info!(listen_addr = %handle.local_addr, "proxy running");
    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown signal received, draining");

    handle.stop_accepting();
    {
        let mut manager = handle.manager.lock().await;
        manager.close_all();
    }
    loop {
        let active = handle.manager.lock().await.active_connections().await;
        if !active {
            break;
        }
        info!("sessions still open, waiting");
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
    info!("drained, exiting");
    Ok(())
}
