//! Hot-reload behavior: the config directory is re-read over HTTP and the
//! diff applied without touching sessions in flight.


use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use harness::{spawn_test_proxy, RecordingUpstream, TestClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use ultraviolet::admin::{self, AdminState};
use ultraviolet::mc::packets::ServerLoginStart;

fn write_backend_file(dir: &Path, file: &str, domain: &str, proxy_to: &str) {
    std::fs::write(
        dir.join("config").join(file),
        format!(
            r#"{{"domains": ["{domain}"], "proxyTo": "{proxy_to}", "rateLimit": 0}}"#
        ),
    )
    .unwrap();
}

/// Minimal HTTP GET over a raw socket; returns the response body.
async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.0\r\nHost: test\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let (head, body) = response.split_once("\r\n\r\n").expect("http response");
    assert!(head.starts_with("HTTP/1.0 200"), "unexpected response: {head}");
    body.to_string()
}

#[tokio::test]
async fn reload_adds_and_removes_backends_without_dropping_sessions() {
    let upstream_a = RecordingUpstream::spawn().await;
    let upstream_b = RecordingUpstream::spawn().await;

    // Config directory starts with backend A only.
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("config")).unwrap();
    write_backend_file(dir.path(), "a.json", "a", &upstream_a.addr.to_string());

    let (configs, errors) =
        ultraviolet::config::read_server_configs(&dir.path().join("config"));
    assert!(errors.is_empty());
    let proxy = spawn_test_proxy(configs).await;

    // Admin surface on its own port.
    let admin_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = admin_listener.local_addr().unwrap();
    let state = AdminState {
        manager: Arc::clone(&proxy.manager),
        config_dir: dir.path().to_path_buf(),
        prometheus: None,
    };
    tokio::spawn(async move {
        let _ = admin::serve_on(admin_listener, state).await;
    });

    // Open a session to A and verify it tunnels.
    let session = TestClient::login(proxy.local_addr, "a", "alice").await;
    let packets = upstream_a.recorded_packets().await;
    assert_eq!(ServerLoginStart::unmarshal(&packets[1]).unwrap().name, "alice");
    let mut session = session.conn.into_inner();

    // Add backend B and reload.
    write_backend_file(dir.path(), "b.json", "b", &upstream_b.addr.to_string());
    let body = http_get(admin_addr, "/reload").await;
    assert!(body.contains("1 added"), "body: {body}");
    assert!(body.contains("1 unchanged"), "body: {body}");

    // New hostname routes to B.
    let b_session = TestClient::login(proxy.local_addr, "b", "bob").await;
    let b_packets = upstream_b.recorded_packets().await;
    assert_eq!(ServerLoginStart::unmarshal(&b_packets[1]).unwrap().name, "bob");
    // Close B's session so only A's remains in flight below.
    drop(b_session);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Remove A; its in-flight session keeps working.
    std::fs::remove_file(dir.path().join("config").join("a.json")).unwrap();
    let body = http_get(admin_addr, "/reload").await;
    assert!(body.contains("1 removed"), "body: {body}");

    session.write_all(b"still-here").await.unwrap();
    let mut echoed = [0u8; 10];
    session.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still-here");

    // The drained worker still counts its session until it closes.
    assert!(proxy.manager.lock().await.active_connections().await);
    drop(session);
    // Close propagates through the session guard to the draining worker.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!proxy.manager.lock().await.active_connections().await);

    // A's hostname no longer routes.
    let mut gone = TestClient::login(proxy.local_addr, "a", "carol").await;
    let mut buf = [0u8; 1];
    let read = gone.conn.into_inner().read(&mut buf).await.unwrap();
    assert_eq!(read, 0, "expected EOF");
}

#[tokio::test]
async fn reload_with_unreadable_file_reports_and_skips() {
    let upstream = RecordingUpstream::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("config")).unwrap();
    write_backend_file(dir.path(), "a.json", "a", &upstream.addr.to_string());

    let proxy = spawn_test_proxy(Vec::new()).await;
    let admin_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = admin_listener.local_addr().unwrap();
    let state = AdminState {
        manager: Arc::clone(&proxy.manager),
        config_dir: dir.path().to_path_buf(),
        prometheus: None,
    };
    tokio::spawn(async move {
        let _ = admin::serve_on(admin_listener, state).await;
    });

    std::fs::write(dir.path().join("config").join("broken.json"), "{oops").unwrap();

    let body = http_get(admin_addr, "/reload").await;
    assert!(body.contains("1 added"), "body: {body}");
    assert!(body.contains("unreadable"), "body: {body}");

    // The good backend is live despite the bad file.
    let _session = TestClient::login(proxy.local_addr, "a", "alice").await;
    let packets = upstream.recorded_packets().await;
    assert_eq!(ServerLoginStart::unmarshal(&packets[1]).unwrap().name, "alice");
}
