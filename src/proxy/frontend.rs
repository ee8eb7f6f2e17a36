//! Frontend workers.
//!
//! A pool of these consumes accepted sockets from the bounded work
//! channel. Each socket gets one deadline-bounded handshake read, a
//! routing-table lookup, a round-trip to the owning backend worker, and
//! then either a synthesized reply or a byte splice to the upstream.

use std::sync::Arc;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::mc::packets::{HandshakeState, ServerBoundHandshake, ServerLoginStart};
use crate::mc::{McConn, Packet, ProtocolError};

use super::answer::{BackendRequest, ProcessAnswer, ProxyEvent};
use super::listener::ClientConn;
use super::router::RoutingTable;

/// Copy buffer for the splice loop.
const SPLICE_BUF_SIZE: usize = 8192;

/// Emits the close event for a proxied session no matter how the splice
/// loop ends.
struct SessionGuard {
    events: mpsc::Sender<ProxyEvent>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.events.try_send(ProxyEvent::Close).is_err() {
            // Buffer full; hand delivery to a task rather than lose the
            // decrement.
            let events = self.events.clone();
            tokio::spawn(async move {
                let _ = events.send(ProxyEvent::Close).await;
            });
        }
    }
}

pub struct FrontendWorker {
    work_rx: Arc<Mutex<mpsc::Receiver<ClientConn>>>,
    router: Arc<RoutingTable>,
    /// Pre-marshaled reply for status requests that match no backend.
    default_status: Packet,
    io_deadline: Duration,
}

impl FrontendWorker {
    pub fn new(
        work_rx: Arc<Mutex<mpsc::Receiver<ClientConn>>>,
        router: Arc<RoutingTable>,
        default_status: Packet,
        io_deadline: Duration,
    ) -> Self {
        Self {
            work_rx,
            router,
            default_status,
            io_deadline,
        }
    }

    /// Pull sockets until the work channel closes.
    pub async fn run(self) {
        loop {
            let conn = { self.work_rx.lock().await.recv().await };
            let Some(conn) = conn else { break };
            let peer = conn.peer;
            if let Err(err) = self.handle(conn).await {
                debug!(client_addr = %peer, error = %err, "connection ended with error");
            }
        }
    }

    async fn handle(&self, conn: ClientConn) -> Result<(), ProtocolError> {
        let ClientConn { stream, peer } = conn;
        let mut client = McConn::new(stream, self.io_deadline);

        let handshake_packet = client.read_packet().await?;
        let handshake = ServerBoundHandshake::unmarshal(&handshake_packet)?;
        let kind = handshake.state();

        // A NextState outside {1, 2} is protocol garbage.
        if kind == HandshakeState::Unknown {
            return Ok(());
        }

        let username = if kind == HandshakeState::Login {
            let login_packet = client.read_packet().await?;
            ServerLoginStart::unmarshal(&login_packet)?.name
        } else {
            String::new()
        };

        let hostname = handshake.parse_server_address();
        let Some(backend) = self.router.lookup(&hostname) else {
            debug!(client_addr = %peer, host = %hostname, kind = %kind, "no backend for hostname");
            if kind == HandshakeState::Status {
                client.write_packet(&self.default_status).await?;
                echo_ping(&mut client, None).await?;
            }
            return Ok(());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = BackendRequest {
            kind,
            handshake,
            server_addr: hostname,
            client_addr: peer,
            username,
            reply: reply_tx,
        };
        if backend.send_request(request).await.is_err() {
            // Worker already closed; treat as a close answer.
            return Ok(());
        }
        let Ok(answer) = reply_rx.await else {
            return Ok(());
        };

        match answer {
            ProcessAnswer::SendStatus { packet, latency } => {
                client.write_packet(&packet).await?;
                echo_ping(&mut client, latency).await?;
            }
            ProcessAnswer::Disconnect { packet } => {
                client.write_packet(&packet).await?;
            }
            ProcessAnswer::Close => {}
            ProcessAnswer::Proxy {
                connector,
                first_packet,
                second_packet,
                events,
            } => {
                let upstream = match connector.connect().await {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(client_addr = %peer, error = %err, "upstream dial failed");
                        return Ok(());
                    }
                };
                let mut upstream = McConn::new(upstream, self.io_deadline);
                upstream.write_packet(&first_packet).await?;
                upstream.write_packet(&second_packet).await?;

                let _ = events.send(ProxyEvent::Open).await;
                let guard = SessionGuard { events };
                // The session gets its own task: it outlives this worker
                // and survives shutdown until either peer hangs up.
                tokio::spawn(async move {
                    let _guard = guard;
                    splice(client.into_inner(), upstream.into_inner()).await;
                });
            }
        }
        Ok(())
    }
}

/// Read the client's ping and echo it back, optionally delaying by the
/// upstream's measured latency so the displayed ping is honest.
async fn echo_ping<S>(client: &mut McConn<S>, latency: Option<Duration>) -> Result<(), ProtocolError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let ping = client.read_packet().await?;
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
    client.write_packet(&ping).await
}

/// Pump bytes both ways until either side reaches EOF or errors.
async fn splice(client: TcpStream, upstream: TcpStream) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = async {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if upstream_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = upstream_write.shutdown().await;
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            match upstream_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = client_write.shutdown().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}
