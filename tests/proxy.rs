//! End-to-end proxy tests over real sockets.


use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use harness::{EchoBackend, ProxyHandle, dead_host_ports, echo_roundtrip, host_port, http_get};
use shunt::config::BalancerKind;

/// Poll until `predicate` holds or two seconds pass.
async fn wait_until(mut predicate: impl FnMut() -> bool, what: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn single_upstream_echo_roundtrip() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(vec![host_port(backend.addr)], BalancerKind::RoundRobin)
        .await
        .unwrap();

    let received = echo_roundtrip(proxy.addr, b"HELLO\n").await.unwrap();
    assert_eq!(received, b"HELLO\n");

    let server = Arc::clone(&proxy.proxy.servers()[0]);
    // Each direction of the tunnel counts one opened and one closed.
    wait_until(|| server.closed().total() >= 1, "half-tunnels to close").await;
    assert!(server.opened().total() >= 1);
    assert!(server.byte_rate().total() >= 6);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn round_robin_skips_index_zero_first() {
    let backend_a = EchoBackend::spawn().await.unwrap();
    let backend_b = EchoBackend::spawn().await.unwrap();
    let backend_c = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(
        vec![
            host_port(backend_a.addr),
            host_port(backend_b.addr),
            host_port(backend_c.addr),
        ],
        BalancerKind::RoundRobin,
    )
    .await
    .unwrap();

    // The cursor advances before picking, so the first client lands on the
    // second server of the list.
    echo_roundtrip(proxy.addr, b"ping").await.unwrap();
    assert_eq!(backend_a.connection_count(), 0);
    assert_eq!(backend_b.connection_count(), 1);
    assert_eq!(backend_c.connection_count(), 0);

    echo_roundtrip(proxy.addr, b"ping").await.unwrap();
    assert_eq!(backend_c.connection_count(), 1);

    echo_roundtrip(proxy.addr, b"ping").await.unwrap();
    assert_eq!(backend_a.connection_count(), 1);

    // Three more clients complete two full cycles: every backend saw two.
    for _ in 0..3 {
        echo_roundtrip(proxy.addr, b"ping").await.unwrap();
    }
    assert_eq!(backend_a.connection_count(), 2);
    assert_eq!(backend_b.connection_count(), 2);
    assert_eq!(backend_c.connection_count(), 2);
}

#[tokio::test]
async fn failover_retries_against_other_servers() {
    let backend = EchoBackend::spawn().await.unwrap();
    // Round-robin visits index 1, then 2, then 0: both dead servers are
    // tried before the live one.
    let dead = dead_host_ports(2).await;
    let proxy = ProxyHandle::spawn(
        vec![host_port(backend.addr), dead[0].clone(), dead[1].clone()],
        BalancerKind::RoundRobin,
    )
    .await
    .unwrap();

    let received = echo_roundtrip(proxy.addr, b"ping").await.unwrap();
    assert_eq!(received, b"ping");

    let servers = proxy.proxy.servers();
    assert_eq!(servers[1].failed().total(), 1);
    assert_eq!(servers[2].failed().total(), 1);
    assert!(servers[0].opened().total() >= 1);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn exhausted_retries_drop_the_client() {
    let proxy = ProxyHandle::spawn(dead_host_ports(3).await, BalancerKind::RoundRobin)
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    // The proxy fails three connects and silently closes the client.
    let mut buf = [0u8; 1];
    let read = client.read(&mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)), "read: {read:?}");

    for server in proxy.proxy.servers() {
        assert_eq!(server.failed().total(), 1);
    }
}

#[tokio::test]
async fn single_dead_upstream_takes_all_three_attempts() {
    let proxy = ProxyHandle::spawn(dead_host_ports(1).await, BalancerKind::RoundRobin)
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let mut buf = [0u8; 1];
    let _ = client.read(&mut buf).await;

    assert_eq!(proxy.proxy.servers()[0].failed().total(), 3);
}

#[tokio::test]
async fn least_used_sends_traffic_to_the_idle_server() {
    let busy = EchoBackend::spawn().await.unwrap();
    let idle = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(
        vec![host_port(busy.addr), host_port(idle.addr)],
        BalancerKind::LeastUsed,
    )
    .await
    .unwrap();

    // Pretend the first server moved a megabyte in the last minute.
    proxy.proxy.servers()[0].increment_byte_rate_by(1 << 20);

    echo_roundtrip(proxy.addr, b"ping").await.unwrap();
    assert_eq!(busy.connection_count(), 0);
    assert_eq!(idle.connection_count(), 1);
}

#[tokio::test]
async fn large_streams_come_back_byte_identical() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(vec![host_port(backend.addr)], BalancerKind::RoundRobin)
        .await
        .unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut read_half, mut write_half) = client.split();

    // No half-close here: either side ending tears the whole tunnel down,
    // so the echo must be drained while the connection is still open.
    let expected = payload.clone();
    let writer = async {
        write_half.write_all(&payload).await.unwrap();
    };
    let reader = async {
        let mut received = vec![0u8; expected.len()];
        read_half.read_exact(&mut received).await.unwrap();
        received
    };
    let ((), received) = tokio::join!(writer, reader);
    assert_eq!(received, expected);

    let server = Arc::clone(&proxy.proxy.servers()[0]);
    // Both directions count towards the server byte rate.
    wait_until(
        || server.byte_rate().total() >= 2 * 256 * 1024,
        "byte counters to settle",
    )
    .await;
}

#[tokio::test]
async fn stop_closes_the_listener_but_drains_tunnels() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(vec![host_port(backend.addr)], BalancerKind::RoundRobin)
        .await
        .unwrap();

    // An in-flight connection established before the shutdown...
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();

    proxy.proxy.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // ...keeps working after it, while new connections are refused.
    client.write_all(b"after!").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after!");

    assert!(TcpStream::connect(proxy.addr).await.is_err());
}

#[tokio::test]
async fn admin_endpoint_tracks_fleet_health() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(vec![host_port(backend.addr)], BalancerKind::RoundRobin)
        .await
        .unwrap();

    let router = shunt::api::router(Arc::clone(&proxy.proxy));
    let status_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let status_addr = status_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(status_listener, router).await;
    });

    let (status, body) = http_get(status_addr, "/admin").await;
    assert_eq!(status, 200);
    assert!(body.contains("\"version\""), "body: {body}");

    // Every server attempted and recently failing: the fleet is unhealthy.
    for server in proxy.proxy.servers() {
        server.increment_opened_conn();
        server.increment_failed_conn();
    }
    let (status, _) = http_get(status_addr, "/admin").await;
    assert_eq!(status, 500);
}

#[tokio::test]
async fn stats_endpoint_serves_the_counters_page() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(vec![host_port(backend.addr)], BalancerKind::RoundRobin)
        .await
        .unwrap();

    let router = shunt::api::router(Arc::clone(&proxy.proxy));
    let status_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let status_addr = status_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(status_listener, router).await;
    });

    echo_roundtrip(proxy.addr, b"HELLO\n").await.unwrap();

    let (status, body) = http_get(status_addr, "/stats").await;
    assert_eq!(status, 200);
    assert!(body.contains("text/html"));
    assert!(body.contains("http-equiv=\"refresh\""));
    assert!(body.contains("Open connections"));
    assert!(body.contains("Healthy servers 1 out of 1"));
}
