//! Client and server relays chained over loopback UDP to an echo server

use shardtun::{ClientRelay, ServerRelay, TunnelConfig, TunnelMode};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn spawn_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&buf[..n], from).await.unwrap();
        }
    });
    addr
}

/// Start both relays; returns the client relay's listening address
async fn spawn_tunnel(base: TunnelConfig) -> SocketAddr {
    let echo = spawn_echo().await;
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let server = ServerRelay::bind(TunnelConfig {
        mode: TunnelMode::Server,
        local_addr: any,
        remote_addr: echo,
        ..base.clone()
    })
    .await
    .unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let client = ClientRelay::bind(TunnelConfig {
        mode: TunnelMode::Client,
        local_addr: any,
        remote_addr: server_addr,
        ..base
    })
    .await
    .unwrap();
    let client_addr = client.local_addr().unwrap();
    tokio::spawn(client.run());

    client_addr
}

async fn roundtrip(app: &UdpSocket, relay: SocketAddr, payload: &[u8]) -> Vec<u8> {
    app.send_to(payload, relay).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, from) = timeout(Duration::from_secs(5), app.recv_from(&mut buf))
        .await
        .expect("echo did not come back")
        .unwrap();
    assert_eq!(from, relay);
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_echo_through_tunnel() {
    let relay = spawn_tunnel(TunnelConfig {
        method: "aes-256-gcm".to_string(),
        password: "relay-test".to_string(),
        ..TunnelConfig::default()
    })
    .await;

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0..5 {
        let payload = format!("echo {}", i).into_bytes();
        assert_eq!(roundtrip(&app, relay, &payload).await, payload);
    }
}

#[tokio::test]
async fn test_echo_through_tunnel_with_fec() {
    let relay = spawn_tunnel(TunnelConfig {
        method: "chacha20".to_string(),
        authenticated: true,
        data_shards: 3,
        parity_shards: 2,
        ..TunnelConfig::default()
    })
    .await;

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let payload = vec![0xA5; 1200];
    assert_eq!(roundtrip(&app, relay, &payload).await, payload);
}

#[tokio::test]
async fn test_separate_sessions_per_source() {
    let relay = spawn_tunnel(TunnelConfig {
        method: "salsa20".to_string(),
        ..TunnelConfig::default()
    })
    .await;

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(roundtrip(&first, relay, b"from first").await, b"from first");
    assert_eq!(roundtrip(&second, relay, b"from second").await, b"from second");
    assert_eq!(roundtrip(&first, relay, b"again").await, b"again");
}

#[tokio::test]
async fn test_client_recovers_once_server_comes_up() {
    let base = TunnelConfig {
        method: "chacha20-ietf".to_string(),
        password: "late-server".to_string(),
        ..TunnelConfig::default()
    };
    let echo = spawn_echo().await;
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

    // Pick a port with nothing listening on it yet.
    let server_addr = {
        let socket = UdpSocket::bind(any).await.unwrap();
        socket.local_addr().unwrap()
    };

    let client = ClientRelay::bind(TunnelConfig {
        mode: TunnelMode::Client,
        local_addr: any,
        remote_addr: server_addr,
        ..base.clone()
    })
    .await
    .unwrap();
    let relay = client.local_addr().unwrap();
    tokio::spawn(client.run());

    // Refused while the server is down; the reply path must survive it.
    let app = UdpSocket::bind(any).await.unwrap();
    app.send_to(b"too early", relay).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let server = ServerRelay::bind(TunnelConfig {
        mode: TunnelMode::Server,
        local_addr: server_addr,
        remote_addr: echo,
        ..base
    })
    .await
    .unwrap();
    tokio::spawn(server.run());

    for i in 0..3 {
        let payload = format!("after {}", i).into_bytes();
        assert_eq!(roundtrip(&app, relay, &payload).await, payload);
    }
}
