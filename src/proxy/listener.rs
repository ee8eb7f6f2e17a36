//! Ingress: listeners and accept loops.
//!
//! One or more accept loops share a listener and push accepted sockets
//! into the bounded work channel; when the frontend workers saturate, the
//! `send().await` blocks and the accept loops apply backpressure. When the
//! proxy runs behind another load balancer, an inbound PROXY v1/v2 header
//! is consumed here and the peer address rewritten before the socket is
//! queued.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::proxy_protocol;

/// Capacity of the accept-to-frontend work channel.
pub const WORK_CHANNEL_CAPACITY: usize = 50;

/// Bound on inbound PROXY header ingestion.
pub const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(1);

/// An accepted client socket with its effective peer address (rewritten
/// when an inbound PROXY header was present).
#[derive(Debug)]
pub struct ClientConn {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Bind the game listener.
pub async fn bind(listen_addr: &str) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(bind_addr = %listener.local_addr()?, "listener bound");
    Ok(listener)
}

/// Spawn `count` accept loops over a shared listener.
pub fn spawn_accept_loops(
    listener: Arc<TcpListener>,
    count: usize,
    accept_proxy_protocol: bool,
    work_tx: mpsc::Sender<ClientConn>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|index| {
            let listener = Arc::clone(&listener);
            let work_tx = work_tx.clone();
            tokio::spawn(async move {
                accept_loop(listener, index, accept_proxy_protocol, work_tx).await;
            })
        })
        .collect()
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    index: usize,
    accept_proxy_protocol: bool,
    work_tx: mpsc::Sender<ClientConn>,
) {
    loop {
        match listener.accept().await {
            Ok((mut stream, mut peer)) => {
                if accept_proxy_protocol {
                    match proxy_protocol::read_inbound_header(&mut stream, PROXY_HEADER_TIMEOUT)
                        .await
                    {
                        Ok(Some(source)) => peer = source,
                        Ok(None) => {}
                        Err(err) => {
                            debug!(peer_addr = %peer, error = %err, "dropping connection with bad proxy header");
                            continue;
                        }
                    }
                }
                debug!(peer_addr = %peer, "accepted connection");
                if work_tx.send(ClientConn { stream, peer }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                error!(listener = index, error = %err, "accept error");
                // Brief sleep to avoid a tight loop on persistent errors.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    warn!(listener = index, "accept loop stopped");
}
