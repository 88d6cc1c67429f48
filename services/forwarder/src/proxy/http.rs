//! HTTP reverse proxying.
//!
//! Each accepted connection is served as HTTP/1 or HTTP/2. Every request is
//! rewritten to the rule's target authority, keeping its path and query, and
//! forwarded with a streaming body in both directions. Redirects from the
//! target are passed through to the client.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, HttpBody as _};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::TryStreamExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server;
use reqwest::Url;
use tokio::sync::watch;
use tower::Service;
use tracing::{debug, info, warn};

use super::listener::{serve, ActiveListener, ConnectionHandler};
use super::wait_for_shutdown;
use crate::error::ForwardError;
use crate::net::Accepted;
use crate::overlay::Overlay;
use crate::rule::{ForwardingRule, Target};

/// Headers scoped to a single hop, never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client for targets on the general network.
pub fn standard_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Forwarder proxying HTTP requests to an `http(s)://` target.
pub struct HttpForwarder {
    rule: Arc<ForwardingRule>,
    target: Url,
    authority: String,
    client: reqwest::Client,
    shutdown: watch::Receiver<bool>,
}

impl HttpForwarder {
    pub fn new(
        rule: Arc<ForwardingRule>,
        target: Url,
        client: reqwest::Client,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let authority = authority_of(&target);
        Self {
            rule,
            target,
            authority,
            client,
            shutdown,
        }
    }

    /// Pick the overlay client for overlay-resident targets, `standard`
    /// otherwise.
    pub fn client_for(
        target: &Target,
        overlay: &dyn Overlay,
        standard: &reqwest::Client,
    ) -> reqwest::Client {
        if target.is_overlay() {
            overlay.http_client()
        } else {
            standard.clone()
        }
    }

    /// Serve connections until the listener closes.
    pub async fn run(self, listener: ActiveListener) {
        info!(
            rule = %self.rule,
            local_addr = %listener.local_addr(),
            "HTTP forwarder started"
        );
        serve(listener, Arc::new(self)).await;
    }

    fn outbound_url(&self, request: &Request) -> Url {
        let mut url = self.target.clone();
        url.set_path(request.uri().path());
        url.set_query(request.uri().query());
        url
    }

    async fn forward(&self, request: Request) -> Result<Response, ForwardError> {
        let url = self.outbound_url(&request);
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let mut headers = end_to_end_headers(request.headers());
        let host = HeaderValue::from_str(&self.authority)
            .map_err(|e| ForwardError::BuildRequest(e.to_string()))?;
        headers.insert(header::HOST, host);

        let body = request.into_body();
        let mut outbound = self
            .client
            .request(method.clone(), url)
            .headers(headers);
        if !body.is_end_stream() {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let outbound = outbound
            .build()
            .map_err(|e| ForwardError::BuildRequest(e.to_string()))?;

        let response = self
            .client
            .execute(outbound)
            .await
            .map_err(|source| ForwardError::Forward {
                target: self.authority.clone(),
                source,
            })?;

        let status = response.status();
        debug!(method = %method, path = %path, status = status.as_u16(), "Forwarded request");

        let headers = end_to_end_headers(response.headers());
        let stream = response.bytes_stream().inspect_err(|e| {
            let err = ForwardError::ResponseStream(e.to_string());
            warn!(error = %err, hint = err.hint(), "Response body failed");
        });

        let mut forwarded = Response::new(Body::from_stream(stream));
        *forwarded.status_mut() = status;
        *forwarded.headers_mut() = headers;
        Ok(forwarded)
    }
}

#[async_trait]
impl ConnectionHandler for HttpForwarder {
    async fn handle(self: Arc<Self>, accepted: Accepted) {
        let conn = match accepted.establish().await {
            Ok(conn) => conn,
            Err(e) => {
                let err = ForwardError::Handshake(e);
                warn!(error = %err, hint = err.hint(), "Connection setup failed");
                return;
            }
        };

        debug!(target_authority = %self.authority, "New connection");

        let router = Router::new()
            .fallback(forward_request)
            .with_state(Arc::clone(&self));
        let service = hyper::service::service_fn(move |request: Request<Incoming>| {
            router.clone().call(request)
        });

        let builder = server::conn::auto::Builder::new(TokioExecutor::new());
        let connection = builder.serve_connection(TokioIo::new(conn), service);

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            result = connection => match result {
                Ok(()) => debug!("Connection closed"),
                Err(e) => {
                    let err = ForwardError::HttpConnection(e.to_string());
                    debug!(error = %err, hint = err.hint(), "Connection closed with error");
                }
            },
            _ = wait_for_shutdown(&mut shutdown) => debug!("Connection closed by shutdown"),
        }
    }
}

async fn forward_request(
    State(forwarder): State<Arc<HttpForwarder>>,
    request: Request,
) -> Response {
    match forwarder.forward(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, hint = err.hint(), "Failed to forward request");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// `host[:port]` of `url`, as sent in the `Host` header.
fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Copy of `headers` without hop-by-hop headers, including any named by
/// `Connection`.
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !HOP_BY_HOP_HEADERS.contains(&name) && !listed.iter().any(|token| token == name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::RecordingOverlay;
    use crate::rule::Transport;

    #[test]
    fn test_authority_keeps_explicit_port() {
        let url = Url::parse("http://backend.internal:8080/base").unwrap();
        assert_eq!(authority_of(&url), "backend.internal:8080");

        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(authority_of(&url), "example.com");

        let url = Url::parse("http://[::1]:9000").unwrap();
        assert_eq!(authority_of(&url), "[::1]:9000");
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.append("x-multi", HeaderValue::from_static("1"));
        headers.append("x-multi", HeaderValue::from_static("2"));

        let forwarded = end_to_end_headers(&headers);
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert!(forwarded.get("keep-alive").is_none());
        assert!(forwarded.get("x-trace").is_none());
        assert!(forwarded.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(forwarded.get(header::ACCEPT).unwrap(), "*/*");
        assert_eq!(forwarded.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn test_overlay_targets_get_the_overlay_client() {
        let overlay = RecordingOverlay::default();
        let standard = standard_http_client().unwrap();

        for spec in [
            "80:http://100.64.0.7:8080",
            "80:https://db.tail1234.ts.net",
            "80:http://[fd7a:115c:a1e0::5]:9000",
        ] {
            let rule = ForwardingRule::parse(spec, Transport::Tcp, false).unwrap();
            HttpForwarder::client_for(rule.target(), &overlay, &standard);
        }
        assert_eq!(overlay.http_clients(), 3);

        for spec in [
            "80:http://127.0.0.1:8080",
            "80:https://example.com",
            "80:http://[::1]:9000",
        ] {
            let rule = ForwardingRule::parse(spec, Transport::Tcp, false).unwrap();
            HttpForwarder::client_for(rule.target(), &overlay, &standard);
        }
        assert_eq!(overlay.http_clients(), 3);
    }

    #[test]
    fn test_outbound_url_uses_inbound_path_and_query() {
        let rule = Arc::new(
            ForwardingRule::parse(
                "80:http://backend.internal:8080/ignored",
                Transport::Tcp,
                false,
            )
            .unwrap(),
        );
        let target = Url::parse("http://backend.internal:8080/ignored").unwrap();
        let (_tx, rx) = watch::channel(false);
        let forwarder =
            HttpForwarder::new(rule, target, standard_http_client().unwrap(), rx);

        let request = axum::http::Request::builder()
            .uri("/api/items?page=2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            forwarder.outbound_url(&request).as_str(),
            "http://backend.internal:8080/api/items?page=2"
        );

        let request = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(
            forwarder.outbound_url(&request).as_str(),
            "http://backend.internal:8080/"
        );
    }
}
