
use harness::{rule, unused_port, ForwarderHandle, HttpBackend, NODE_NAME};
use reqwest::StatusCode;
use tailport_forwarder::Transport;

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn request_is_rewritten_to_target() {
    let backend = HttpBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:http://{}/ignored/base", backend.authority()),
        Transport::Tcp,
        false,
    )])
    .await;

    let response = client()
        .post(format!("http://{}/api/items?page=2&sort=asc", forwarder.addr(0)))
        .header("proxy-authorization", "Basic c2VjcmV0")
        .header("x-custom", "kept")
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-seen-method"], "POST");
    assert_eq!(headers["x-seen-path"], "/api/items?page=2&sort=asc");
    assert_eq!(headers["x-seen-host"], backend.authority().as_str());
    assert_eq!(headers["x-seen-hop-by-hop"], "no");
    assert_eq!(response.text().await.unwrap(), "payload");

    forwarder.shutdown().await;
}

#[tokio::test]
async fn large_bodies_stream_both_ways() {
    let backend = HttpBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:http://{}", backend.authority()),
        Transport::Tcp,
        false,
    )])
    .await;

    let body: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
    let response = client()
        .put(format!("http://{}/upload", forwarder.addr(0)))
        .body(body.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), body.as_slice());

    forwarder.shutdown().await;
}

#[tokio::test]
async fn redirects_are_passed_through() {
    let backend = HttpBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:http://{}", backend.authority()),
        Transport::Tcp,
        false,
    )])
    .await;

    let response = client()
        .get(format!("http://{}/redirect", forwarder.addr(0)))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/elsewhere");

    forwarder.shutdown().await;
}

#[tokio::test]
async fn unreachable_target_returns_bad_gateway() {
    let dead_port = unused_port().await;
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:http://127.0.0.1:{}", dead_port),
        Transport::Tcp,
        false,
    )])
    .await;

    // Same client, so later requests may reuse the connection.
    let client = client();
    for _ in 0..3 {
        let response = client
            .get(format!("http://{}/health", forwarder.addr(0)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    // A fresh connection is still accepted.
    let response = reqwest::get(format!("http://{}/", forwarder.addr(0)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    forwarder.shutdown().await;
}

#[tokio::test]
async fn tls_listener_serves_https() {
    let backend = HttpBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::start(vec![rule(
        &format!("0:http://{}", backend.authority()),
        Transport::Tcp,
        true,
    )])
    .await;
    let listen = forwarder.addr(0);

    let cert = reqwest::Certificate::from_der(forwarder.certificate().as_ref()).unwrap();
    let client = reqwest::Client::builder()
        .tls_built_in_root_certs(false)
        .add_root_certificate(cert)
        .resolve(NODE_NAME, listen)
        .build()
        .unwrap();

    let response = client
        .get(format!("https://{}:{}/secure?x=1", NODE_NAME, listen.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-seen-path"], "/secure?x=1");
    assert_eq!(response.headers()["x-seen-host"], backend.authority().as_str());

    forwarder.shutdown().await;
}
