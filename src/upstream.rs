//! Forwarding of client requests to the backend
//!
//! Requests go through a pooled hyper client so connections to the backend
//! are reused across requests and across queue drains.

use crate::error::ProxyError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Body type of every response the proxy sends
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
pub type ProxyResponse = Response<ProxyBody>;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Maximum idle pooled connections to the backend
const POOL_MAX_IDLE: usize = 10;
/// Idle pooled connection timeout
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// A client request waiting to be forwarded
pub struct ForwardRequest {
    pub request: Request<Incoming>,
    pub client_addr: SocketAddr,
}

/// Forwards requests to one target port of the backend
pub struct Upstream {
    client: Client<HttpConnector, Incoming>,
    target_host: String,
    target_port: u16,
    timeout: Duration,
}

impl Upstream {
    pub fn new(target_host: &str, target_port: u16, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self {
            client,
            target_host: target_host.to_string(),
            target_port,
            timeout,
        }
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `host:port` of the backend, as sent in the `Host` header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// Send a request to the backend and return its response verbatim.
    pub async fn forward(&self, forward: ForwardRequest) -> Result<ProxyResponse, ProxyError> {
        let ForwardRequest {
            request,
            client_addr,
        } = forward;

        let authority = self.authority();
        let (mut parts, body) = request.into_parts();

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", authority, path);

        let original_host = original_host(&parts.headers, parts.uri.authority().map(|a| a.as_str()));
        rewrite_headers(&mut parts.headers, &authority, original_host, client_addr)
            .map_err(|e| ProxyError::InternalForwarding(e.to_string()))?;

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(Version::HTTP_11);
        if let Some(headers) = builder.headers_mut() {
            *headers = parts.headers;
        }
        let backend_req = builder
            .body(body)
            .map_err(|e| ProxyError::InternalForwarding(e.to_string()))?;

        debug!(%uri, "Forwarding request to backend");

        let response = match tokio::time::timeout(self.timeout, self.client.request(backend_req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(port = self.target_port, error = %e, "Failed to forward request");
                return Err(ProxyError::UpstreamConnection(e.to_string()));
            }
            Err(_) => {
                warn!(
                    port = self.target_port,
                    timeout_secs = self.timeout.as_secs(),
                    "Backend request timed out"
                );
                return Err(ProxyError::UpstreamTimeout(self.timeout));
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// The host the client addressed: the `Host` header, or the URI authority
/// for HTTP/2 requests
fn original_host(headers: &HeaderMap, uri_authority: Option<&str>) -> Option<HeaderValue> {
    headers
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| uri_authority.and_then(|a| HeaderValue::from_str(a).ok()))
}

/// Strip hop-by-hop headers, point `Host` at the backend and set the
/// `X-Forwarded-*` headers. Client-supplied `X-Forwarded-*` values are
/// overwritten.
fn rewrite_headers(
    headers: &mut HeaderMap,
    authority: &str,
    original_host: Option<HeaderValue>,
    client_addr: SocketAddr,
) -> Result<(), hyper::header::InvalidHeaderValue> {
    // Headers the client marked as connection-specific go too
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }

    headers.insert(hyper::header::HOST, HeaderValue::from_str(authority)?);
    headers.insert(
        X_FORWARDED_FOR,
        HeaderValue::from_str(&client_addr.ip().to_string())?,
    );
    match original_host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    Ok(())
}
