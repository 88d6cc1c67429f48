
use std::time::Duration;

use harness::{
    roundtrip, rule, tls_client_connect, unused_port, ForwarderHandle, TcpEchoBackend,
    UdpEchoBackend, NODE_NAME,
};
use tailport_forwarder::Transport;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

#[tokio::test]
async fn tcp_rule_relays_bytes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:{}", backend.addr.port()),
        Transport::Tcp,
        false,
    )])
    .await;

    for size in [0usize, 1, 1500, 128 * 1024] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        let mut stream = TcpStream::connect(forwarder.addr(0)).await.unwrap();
        let echoed = roundtrip(&mut stream, &payload).await.unwrap();
        assert_eq!(echoed.len(), size);
        assert_eq!(echoed, payload);
    }

    forwarder.shutdown().await;
}

#[tokio::test]
async fn remote_host_target_is_dialed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:localhost:{}", backend.addr.port()),
        Transport::Tcp,
        false,
    )])
    .await;

    let mut stream = TcpStream::connect(forwarder.addr(0)).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"remote").await.unwrap(), b"remote");

    forwarder.shutdown().await;
}

#[tokio::test]
async fn dial_failure_closes_inbound_and_keeps_accepting() {
    let dead_port = unused_port().await;
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![
        rule(&format!("0:{}", dead_port), Transport::Tcp, false),
        rule(&format!("0:{}", backend.addr.port()), Transport::Tcp, false),
    ])
    .await;

    for _ in 0..3 {
        let mut stream = TcpStream::connect(forwarder.addr(0)).await.unwrap();
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("inbound connection should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    // Other rules are unaffected.
    let mut stream = TcpStream::connect(forwarder.addr(1)).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"still up").await.unwrap(), b"still up");

    forwarder.shutdown().await;
}

#[tokio::test]
async fn udp_rule_relays_datagrams() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:{}", backend.addr.port()),
        Transport::Udp,
        false,
    )])
    .await;
    let listen = forwarder.addr(0);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 1024];
    for message in [&b"first"[..], b"second", b"third"] {
        client.send_to(message, listen).await.unwrap();
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("no reply through UDP rule")
            .unwrap();
        assert_eq!(&buf[..n], message);
        assert_eq!(from, listen);
    }

    // A second peer gets its own session.
    let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    other.send_to(b"other", listen).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(2), other.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"other");

    forwarder.shutdown().await;
}

#[tokio::test]
async fn tls_rule_terminates_and_relays() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:{}", backend.addr.port()),
        Transport::Tcp,
        true,
    )])
    .await;

    let mut stream = tls_client_connect(forwarder.addr(0), NODE_NAME, &forwarder.certificate())
        .await
        .unwrap();
    assert_eq!(
        roundtrip(&mut stream, b"over tls").await.unwrap(),
        b"over tls"
    );

    // The backend sees plaintext.
    assert_eq!(backend.connection_count(), 1);

    forwarder.shutdown().await;
}

#[tokio::test]
async fn failed_handshake_does_not_stop_listener() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:{}", backend.addr.port()),
        Transport::Tcp,
        true,
    )])
    .await;

    // Plaintext client on a TLS listener.
    let mut plain = TcpStream::connect(forwarder.addr(0)).await.unwrap();
    let _ = roundtrip(&mut plain, b"not a client hello").await;
    drop(plain);

    let mut stream = tls_client_connect(forwarder.addr(0), NODE_NAME, &forwarder.certificate())
        .await
        .unwrap();
    assert_eq!(roundtrip(&mut stream, b"ok").await.unwrap(), b"ok");
    assert_eq!(backend.connection_count(), 1);

    forwarder.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_active_relays() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:{}", backend.addr.port()),
        Transport::Tcp,
        false,
    )])
    .await;
    let listen = forwarder.addr(0);

    let mut stream = TcpStream::connect(listen).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"before").await.unwrap(), b"before");

    forwarder.shutdown().await;

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("relay should be torn down on shutdown");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(TcpStream::connect(listen).await.is_err());
}
