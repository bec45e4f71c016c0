//! Pooled HTTP client for backend containers
//!
//! One hyper client with keep-alive pooling serves every backend; requests
//! are re-targeted at the route's endpoint while end-to-end headers pass
//! through untouched.

use crate::routes::BackendEndpoint;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Headers that must not be forwarded hop to hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
pub enum UpstreamError {
    /// Dial or transport failure talking to the backend
    Connect(hyper_util::client::legacy::Error),
    /// The outgoing request could not be constructed
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Connect(e) => write!(f, "Upstream connection error: {e}"),
            UpstreamError::RequestBuild(s) => write!(f, "Request build error: {s}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Connect(err)
    }
}

#[derive(Clone)]
pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client }
    }

    /// Forward `req` to `backend`, streaming the body both ways.
    pub async fn send(
        &self,
        req: Request<Incoming>,
        backend: &BackendEndpoint,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", backend.authority(), path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_hop_by_hop(header: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(header))
}
