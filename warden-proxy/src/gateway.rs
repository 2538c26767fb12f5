//! Request gateway.
//!
//! Turns one client request into a breaker admission, a backend call and a
//! recorded outcome. Rejections never reach a backend and never touch the
//! timeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::header::{HeaderMap, HeaderName, HeaderValue, ALLOW, CONNECTION, HOST, RETRY_AFTER};
use hyper::http::uri::{PathAndQuery, Uri};
use hyper::{Request, Response, StatusCode};
use warden_core::{AdmissionError, Breaker, Outcome};

use crate::server::ClientAddr;
use crate::transport::Transport;
use crate::{empty, full, ProxyBody};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Admits requests through a [`Breaker`] and forwards them over a [`Transport`].
pub struct Gateway {
    breaker: Arc<Breaker>,
    transport: Arc<dyn Transport>,
    backend_timeout: Duration,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("breaker", &self.breaker)
            .field("backend_timeout", &self.backend_timeout)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Creates a gateway. Backend calls taking longer than `backend_timeout`
    /// to produce a response head are answered with `504`.
    pub fn new(
        breaker: Arc<Breaker>,
        transport: Arc<dyn Transport>,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            breaker,
            transport,
            backend_timeout,
        }
    }

    /// The breaker requests are admitted through.
    pub fn breaker(&self) -> &Arc<Breaker> {
        &self.breaker
    }

    /// Serves one client request.
    pub async fn serve_request(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let host = request_host(&req).unwrap_or_default();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let ticket = match self.breaker.admit(&host, method.as_str(), &path) {
            Ok(ticket) => ticket,
            Err(err) => {
                tracing::debug!(host, %method, path, reason = %err, "request rejected");
                return rejection(&err);
            }
        };

        let req = prepare_upstream(req);
        let transport = self.transport.clone();
        let timeout = self.backend_timeout;

        // The call runs detached so a client hanging up cannot drop the outcome.
        let call = tokio::spawn(async move {
            let started = Instant::now();
            let backend = ticket.backend().clone();
            let result = tokio::time::timeout(timeout, transport.forward(&backend, req)).await;

            let (outcome, response) = match result {
                Ok(Ok(response)) => (
                    Outcome::from_status(response.status().as_u16()),
                    prepare_downstream(response),
                ),
                Ok(Err(err)) => {
                    tracing::warn!(app = ticket.app(), backend = %backend, error = %err, "backend unreachable");
                    (Outcome::Unreachable, status(StatusCode::BAD_GATEWAY))
                }
                Err(_) => {
                    tracing::warn!(app = ticket.app(), backend = %backend, ?timeout, "backend timed out");
                    (Outcome::Timeout, status(StatusCode::GATEWAY_TIMEOUT))
                }
            };

            tracing::debug!(
                app = ticket.app(),
                route = ticket.route(),
                params = ?ticket.params(),
                backend = %backend,
                probe = ticket.is_probe(),
                status = response.status().as_u16(),
                elapsed = ?started.elapsed(),
                "request forwarded"
            );
            ticket.complete(outcome);
            response
        });

        match call.await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "forwarding task failed");
                status(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// The host a request is addressed to: the Host header, else the URI authority.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
        .map(|host| host.trim().to_string())
}

fn status(code: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = code;
    response
}

fn rejection(err: &AdmissionError) -> Response<ProxyBody> {
    let code = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::NOT_FOUND);
    let mut response = Response::new(full(format!("{err}\n")));
    *response.status_mut() = code;

    match err {
        AdmissionError::MethodMiss { allowed, .. } => {
            if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
                response.headers_mut().insert(ALLOW, value);
            }
        }
        AdmissionError::Rejected { retry_after_ms, .. } => {
            let seconds = retry_after_ms.div_ceil(1000).max(1);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        _ => {}
    }
    response
}

/// Removes hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrites a client request for the backend: origin-form target, Host kept,
/// hop-by-hop headers dropped and the client appended to `X-Forwarded-For`.
fn prepare_upstream(req: Request<ProxyBody>) -> Request<ProxyBody> {
    let (mut parts, body) = req.into_parts();
    let client = parts.extensions.get::<ClientAddr>().map(|addr| addr.0.ip());

    if parts.headers.get(HOST).is_none() {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(HOST, value);
            }
        }
    }

    if parts.uri.scheme().is_some() || parts.uri.authority().is_some() {
        let target = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let mut uri = hyper::http::uri::Parts::default();
        uri.path_and_query = Some(target);
        if let Ok(origin) = Uri::from_parts(uri) {
            parts.uri = origin;
        }
    }

    strip_hop_by_hop(&mut parts.headers);

    if let Some(ip) = client {
        let forwarded = match parts
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
    }

    Request::from_parts(parts, body)
}

fn prepare_downstream(mut response: Response<ProxyBody>) -> Response<ProxyBody> {
    strip_hop_by_hop(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use warden_core::domain::backend::Backend;
    use warden_core::{AppConfig, BreakerConfig};

    /// What the mock transport does with a request.
    #[derive(Clone, Copy)]
    enum Reply {
        Status(u16),
        Refuse,
        Hang,
    }

    struct MockTransport {
        reply: Mutex<Reply>,
        seen: Mutex<Vec<(String, Request<()>)>>,
    }

    impl MockTransport {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(reply),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn forward(
            &self,
            backend: &Backend,
            req: Request<ProxyBody>,
        ) -> Result<Response<ProxyBody>, TransportError> {
            let (parts, _) = req.into_parts();
            self.seen
                .lock()
                .unwrap()
                .push((backend.addr.clone(), Request::from_parts(parts, ())));

            let reply = *self.reply.lock().unwrap();
            match reply {
                Reply::Status(code) => {
                    let mut response = Response::new(full("ok"));
                    *response.status_mut() = StatusCode::from_u16(code).unwrap();
                    response
                        .headers_mut()
                        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
                    response
                        .headers_mut()
                        .insert("keep-alive", HeaderValue::from_static("timeout=5"));
                    Ok(response)
                }
                Reply::Refuse => Err(TransportError::Connect {
                    addr: backend.addr.clone(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                }),
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn gateway(transport: Arc<MockTransport>) -> Gateway {
        let breaker = Arc::new(Breaker::new(BreakerConfig::default()));
        breaker
            .register(
                &AppConfig::from_json(
                    r#"{"name": "api", "urls": ["/users/:id", "/users"],
                        "methods": ["GET", "POST"],
                        "backends": [{"url": "10.0.0.1:80", "weight": 1}]}"#,
                )
                .unwrap(),
            )
            .unwrap();
        Gateway::new(breaker, transport, Duration::from_secs(30))
    }

    fn request(method: &str, host: &str, uri: &str) -> Request<ProxyBody> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, host)
            .body(empty())
            .unwrap();
        req.extensions_mut()
            .insert(ClientAddr(SocketAddr::from(([192, 0, 2, 7], 40000))));
        req
    }

    #[tokio::test]
    async fn test_forwards_and_records_success() {
        let transport = MockTransport::new(Reply::Status(200));
        let gw = gateway(transport.clone());

        let response = gw.serve_request(request("GET", "api:23456", "/users/7")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONNECTION).is_none());
        assert!(response.headers().get("keep-alive").is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "ok");

        let counters = gw.breaker().app("api").unwrap().timeline().snapshot();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].success, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_upstream_request_rewrite() {
        let transport = MockTransport::new(Reply::Status(200));
        let gw = gateway(transport.clone());

        let mut req = request("GET", "api", "http://api/users/7?full=1");
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close, x-trace"));
        req.headers_mut()
            .insert("x-trace", HeaderValue::from_static("1"));
        req.headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1"));
        gw.serve_request(req).await;

        let seen = transport.seen.lock().unwrap();
        let (addr, upstream) = &seen[0];
        assert_eq!(addr, "10.0.0.1:80");
        assert_eq!(upstream.uri(), "/users/7?full=1");
        assert_eq!(upstream.headers()[HOST], "api");
        assert!(upstream.headers().get(CONNECTION).is_none());
        assert!(upstream.headers().get("x-trace").is_none());
        assert_eq!(
            upstream.headers()[X_FORWARDED_FOR],
            "198.51.100.1, 192.0.2.7"
        );
    }

    #[tokio::test]
    async fn test_server_error_is_passed_through_and_counted() {
        let transport = MockTransport::new(Reply::Status(503));
        let gw = gateway(transport);

        let response = gw.serve_request(request("GET", "api", "/users")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let counters = gw.breaker().app("api").unwrap().timeline().snapshot();
        assert_eq!(counters[0].server_error, 1);
    }

    #[tokio::test]
    async fn test_client_error_counts_as_success() {
        let transport = MockTransport::new(Reply::Status(404));
        let gw = gateway(transport);

        let response = gw.serve_request(request("GET", "api", "/users")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let counters = gw.breaker().app("api").unwrap().timeline().snapshot();
        assert_eq!(counters[0].success, 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let transport = MockTransport::new(Reply::Refuse);
        let gw = gateway(transport);

        let response = gw.serve_request(request("GET", "api", "/users")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let counters = gw.breaker().app("api").unwrap().timeline().snapshot();
        assert_eq!(counters[0].unreachable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_is_gateway_timeout() {
        let transport = MockTransport::new(Reply::Hang);
        let gw = gateway(transport);

        let response = gw.serve_request(request("GET", "api", "/users")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let counters = gw.breaker().app("api").unwrap().timeline().snapshot();
        assert_eq!(counters[0].timeout, 1);
    }

    #[tokio::test]
    async fn test_admission_rejections() {
        let transport = MockTransport::new(Reply::Status(200));
        let gw = gateway(transport.clone());

        let response = gw.serve_request(request("GET", "billing", "/users")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = gw.serve_request(request("GET", "api", "/orders")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = gw.serve_request(request("DELETE", "api", "/users")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");

        assert_eq!(transport.calls(), 0);
        assert!(gw.breaker().app("api").unwrap().timeline().snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_answers_too_many_requests() {
        let transport = MockTransport::new(Reply::Status(500));
        let gw = gateway(transport.clone());

        for _ in 0..10 {
            gw.serve_request(request("GET", "api", "/users")).await;
        }
        assert_eq!(transport.calls(), 10);

        let response = gw.serve_request(request("GET", "api", "/users")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "6");
        assert_eq!(transport.calls(), 10);
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = Request::builder()
            .uri("http://other/x")
            .header(HOST, " api:8080 ")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("api:8080"));

        let req = Request::builder().uri("http://other/x").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("other"));

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }
}
