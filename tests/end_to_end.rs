//! End-to-end behavior through real sockets: a client on one side, fake
//! upstreams on the other, the full listener/frontend/backend topology in
//! between.


use std::time::Duration;

use harness::{backend_config, spawn_test_proxy, RecordingUpstream, StatusUpstream, TestClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use ultraviolet::mc::packets::{
    ClientBoundDisconnect, ServerBoundHandshake, ServerLoginStart, SimpleStatus,
};
use ultraviolet::mc::Packet;

#[tokio::test]
async fn empty_config_serves_default_status_and_echoes_ping() {
    let proxy = spawn_test_proxy(Vec::new()).await;

    let (status, pong) = TestClient::status_with_ping(proxy.local_addr, "anything").await;
    let status = SimpleStatus::unmarshal(&status).unwrap();
    assert_eq!(status.name, "Ultraviolet");
    assert_eq!(status.description, "default");
    assert_eq!(pong, Packet::new(0x01, vec![1, 2, 3, 4, 5, 6, 7, 8]));
}

#[tokio::test]
async fn offline_backend_serves_configured_offline_status() {
    // Reserve a port with nothing listening on it.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut cfg = backend_config("uv.json", &["uv"], &dead_addr.to_string());
    cfg.offline_status = SimpleStatus {
        name: "off".to_string(),
        protocol: 755,
        description: "down".to_string(),
    };
    let proxy = spawn_test_proxy(vec![cfg]).await;

    let status = TestClient::request_status(proxy.local_addr, "uv").await;
    let status = SimpleStatus::unmarshal(&status).unwrap();
    assert_eq!(status.name, "off");
    assert_eq!(status.protocol, 755);
    assert_eq!(status.description, "down");
}

#[tokio::test]
async fn login_forwards_handshake_and_login_start_then_tunnels() {
    let upstream = RecordingUpstream::spawn().await;
    let cfg = backend_config("uv.json", &["uv"], &upstream.addr.to_string());
    let proxy = spawn_test_proxy(vec![cfg]).await;

    let client = TestClient::login(proxy.local_addr, "uv", "alice").await;

    let packets = upstream.recorded_packets().await;
    let handshake = ServerBoundHandshake::unmarshal(&packets[0]).unwrap();
    assert_eq!(handshake.server_address, "uv");
    assert_eq!(handshake.next_state, 2);
    assert_eq!(
        TestClient::handshake("uv", 2).marshal().marshal(),
        packets[0].marshal(),
        "handshake bytes forwarded unchanged"
    );
    let login = ServerLoginStart::unmarshal(&packets[1]).unwrap();
    assert_eq!(login.name, "alice");

    // The upstream echoes from here on: what goes in comes back.
    let mut stream = client.conn.into_inner();
    stream.write_all(b"play-bytes").await.unwrap();
    let mut echoed = [0u8; 10];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"play-bytes");
}

#[tokio::test]
async fn second_login_within_rate_window_is_disconnected() {
    let upstream = RecordingUpstream::spawn().await;
    let mut cfg = backend_config("uv.json", &["uv"], &upstream.addr.to_string());
    cfg.rate_limit = 1;
    cfg.rate_cooldown = "1s".to_string();
    cfg.reconnect_msg = "slow down".to_string();
    let proxy = spawn_test_proxy(vec![cfg]).await;

    // First login is proxied; the upstream sees its packets.
    let _first = TestClient::login(proxy.local_addr, "uv", "alice").await;
    let packets = upstream.recorded_packets().await;
    assert_eq!(ServerLoginStart::unmarshal(&packets[1]).unwrap().name, "alice");

    // Second login from the same address inside the window is refused.
    let mut second = TestClient::login(proxy.local_addr, "uv", "alice").await;
    let refusal = second.conn.read_packet().await.unwrap();
    let disconnect = ClientBoundDisconnect::unmarshal(&refusal).unwrap();
    assert_eq!(disconnect.reason, "slow down");
}

#[tokio::test]
async fn warmed_status_cache_outlives_upstream_until_cooldown() {
    let real_status = SimpleStatus {
        name: "real".to_string(),
        protocol: 755,
        description: "live upstream".to_string(),
    };
    let mut upstream = StatusUpstream::spawn(real_status.clone()).await;

    let mut cfg = backend_config("uv.json", &["uv"], &upstream.addr.to_string());
    cfg.cache_status = true;
    cfg.cache_update_cooldown = "400ms".to_string();
    // Keep liveness pinned to the warm probe so only the cache decides.
    cfg.state_update_cooldown = "30s".to_string();
    cfg.offline_status = SimpleStatus {
        name: "off".to_string(),
        protocol: 755,
        description: "down".to_string(),
    };
    let proxy = spawn_test_proxy(vec![cfg]).await;

    // Warm the cache through a real request.
    let status = TestClient::request_status(proxy.local_addr, "uv").await;
    assert_eq!(SimpleStatus::unmarshal(&status).unwrap(), real_status);

    upstream.kill();

    // Within the cooldown the warmed packet is still served.
    let status = TestClient::request_status(proxy.local_addr, "uv").await;
    assert_eq!(SimpleStatus::unmarshal(&status).unwrap(), real_status);

    // After the cooldown the refresh fails and the offline status wins.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = TestClient::request_status(proxy.local_addr, "uv").await;
    let status = SimpleStatus::unmarshal(&status).unwrap();
    assert_eq!(status.name, "off");
    assert_eq!(status.description, "down");
}

#[tokio::test]
async fn unknown_hostname_login_is_closed() {
    let proxy = spawn_test_proxy(Vec::new()).await;

    let mut client = TestClient::login(proxy.local_addr, "nowhere", "alice").await;
    // The proxy closes without writing anything.
    let mut buf = [0u8; 1];
    let read = client.conn.into_inner().read(&mut buf).await.unwrap();
    assert_eq!(read, 0, "expected EOF");
}

#[tokio::test]
async fn garbage_handshake_closes_silently() {
    let proxy = spawn_test_proxy(Vec::new()).await;

    let mut stream = tokio::net::TcpStream::connect(proxy.local_addr)
        .await
        .unwrap();
    // Oversized length prefix.
    stream
        .write_all(&[0xff, 0xff, 0xff, 0xff, 0x7f])
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    let read = stream.read(&mut buf).await.unwrap();
    assert_eq!(read, 0, "expected EOF");
}
