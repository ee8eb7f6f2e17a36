//! Upstream connection creation.
//!
//! A [`ConnectionCreator`] knows how to dial one backend: target address,
//! optional local bind, and a bounded timeout. It never mutates shared
//! state. The [`UpstreamConnector`] pairs a creator with one client's
//! address so the frontend can decide the actual dial moment; dialing for
//! clients that disconnect immediately is avoided entirely.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

use super::proxy_protocol;

/// Dials TCP to a fixed target with a bounded timeout, optionally binding
/// the local endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionCreator {
    target: SocketAddr,
    bind: Option<IpAddr>,
    dial_timeout: Duration,
}

impl ConnectionCreator {
    pub fn new(target: SocketAddr, bind: Option<IpAddr>, dial_timeout: Duration) -> Self {
        Self {
            target,
            bind,
            dial_timeout,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Dial the upstream. No PROXY header is written; liveness probes and
    /// status refreshes use this directly so the upstream never mistakes
    /// them for real clients.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        let socket = match self.target {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(ip) = self.bind {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        match timeout(self.dial_timeout, socket.connect(self.target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    /// Dial the upstream and prefix the stream with a PROXY v2 header
    /// carrying `client_addr` as the source.
    pub async fn connect_with_proxy_header(
        &self,
        client_addr: SocketAddr,
    ) -> io::Result<TcpStream> {
        let mut stream = self.connect().await?;
        let header = proxy_protocol::encode_v2(client_addr, self.target);
        stream.write_all(&header).await?;
        Ok(stream)
    }
}

/// A deferred upstream dial on behalf of one client, carried inside a
/// proxy answer. The frontend invokes it once it has decided to tunnel.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    creator: ConnectionCreator,
    client_addr: SocketAddr,
    send_proxy_header: bool,
}

impl UpstreamConnector {
    pub fn new(
        creator: ConnectionCreator,
        client_addr: SocketAddr,
        send_proxy_header: bool,
    ) -> Self {
        Self {
            creator,
            client_addr,
            send_proxy_header,
        }
    }

    pub async fn connect(&self) -> io::Result<TcpStream> {
        if self.send_proxy_header {
            self.creator
                .connect_with_proxy_header(self.client_addr)
                .await
        } else {
            self.creator.connect().await
        }
    }
}
