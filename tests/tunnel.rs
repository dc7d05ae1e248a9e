//! End-to-end tunnel tests: a client-role and a server-role process wired
//! through real TCP sockets on loopback, sharing one seed file.

use portshade::{Env, ProxyConfig, Role, Seed, Server, Statistics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn test_root() -> PathBuf {
    std::env::temp_dir().join(format!("portshade-e2e-{:x}", rand::random::<u64>()))
}

/// Write a fixed seed blob before any proxy loads it, so validation-failure
/// tests get a short close delay instead of a random one.
fn write_seed(root: &PathBuf) {
    let env = Env::new(root.clone());
    let mut blob = vec![0u8; 128];
    blob[0..8].copy_from_slice(&0x7788_99aa_bbcc_ddeei64.to_le_bytes());
    blob[8] = 5; // pad_begin
    blob[9] = 9; // pad_end
    blob[10] = 0; // smallest close-delay bound
    std::fs::create_dir_all(env.config_root()).unwrap();
    std::fs::write(env.config_root().join("seed"), &blob).unwrap();
}

/// Echo server closing each connection after `rounds` request/response
/// exchanges (or on client EOF).
async fn spawn_echo(rounds: usize) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                for _ in 0..rounds {
                    let count = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(count) => count,
                    };
                    if socket.write_all(&buf[..count]).await.is_err() {
                        return;
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

/// Start one proxy role on an ephemeral loopback port; returns the bound
/// port and its statistics handle.
async fn spawn_proxy(role: Role, upstream_port: u16, root: &PathBuf) -> (u16, Arc<Statistics>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = Arc::new(ProxyConfig {
        role,
        listen: listener.local_addr().unwrap(),
        upstream_host: "127.0.0.1".to_string(),
        upstream_port,
        ..ProxyConfig::default()
    });
    let env = Env::new(root.clone());
    let seed = Arc::new(Seed::load(&env).unwrap());
    let stats = Statistics::load(&env).unwrap();

    let server = Server::new(config, seed, Arc::clone(&stats));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (port, stats)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(20);
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    timeout(deadline, poll).await.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_round_trip_through_both_roles() {
    let root = test_root();
    write_seed(&root);

    let echo_port = spawn_echo(usize::MAX).await;
    let (server_port, server_stats) = spawn_proxy(Role::Server, echo_port, &root).await;
    let (client_port, client_stats) = spawn_proxy(Role::Client, server_port, &root).await;

    let mut app = TcpStream::connect(("127.0.0.1", client_port)).await.unwrap();
    for payload in [&b"\x01\x02\x03"[..], b"hello through the tunnel", &[0u8; 2000]] {
        app.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        timeout(Duration::from_secs(10), app.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, payload);
    }

    assert_eq!(client_stats.connection_count(), 1);
    assert_eq!(server_stats.connection_count(), 1);

    drop(app);
    wait_until("both sides to close", || {
        client_stats.active_connection_count() == 0 && server_stats.active_connection_count() == 0
    })
    .await;

    assert_eq!(client_stats.success_connection_count(), 1);
    assert_eq!(server_stats.success_connection_count(), 1);
    assert_eq!(client_stats.failed_connection_count(), 0);
    assert_eq!(server_stats.failed_connection_count(), 0);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_unvalidated_peer_is_rejected() {
    let root = test_root();
    write_seed(&root);

    let echo_port = spawn_echo(usize::MAX).await;
    let (server_port, server_stats) = spawn_proxy(Role::Server, echo_port, &root).await;

    // Talk to the server role directly, without the handshake token. The
    // garbage decodes to an out-of-range length and must never reach the
    // echo service.
    let mut probe = TcpStream::connect(("127.0.0.1", server_port)).await.unwrap();
    probe.write_all(&[0xffu8; 64]).await.unwrap();

    // Nothing comes back; the socket just goes away after the random delay.
    let mut buf = [0u8; 1];
    let count = timeout(Duration::from_secs(20), probe.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(count, 0);

    wait_until("rejection to be recorded", || {
        server_stats.failed_connection_count() == 1
    })
    .await;
    assert_eq!(server_stats.success_connection_count(), 0);

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_upstream_close_propagates_to_application() {
    let root = test_root();
    write_seed(&root);

    // The echo service hangs up after one exchange.
    let echo_port = spawn_echo(1).await;
    let (server_port, _server_stats) = spawn_proxy(Role::Server, echo_port, &root).await;
    let (client_port, client_stats) = spawn_proxy(Role::Client, server_port, &root).await;

    let mut app = TcpStream::connect(("127.0.0.1", client_port)).await.unwrap();
    app.write_all(b"once").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(10), app.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"once");

    // The service-side close has to travel through both relays back to the
    // application as EOF.
    let count = timeout(Duration::from_secs(10), app.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count, 0);

    wait_until("client side to close", || {
        client_stats.active_connection_count() == 0
    })
    .await;
    assert_eq!(client_stats.success_connection_count(), 1);

    std::fs::remove_dir_all(&root).ok();
}
