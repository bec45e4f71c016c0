//! Request pipeline and reverse proxy engine
//!
//! Every request, plaintext or TLS, passes the same ordered pipeline:
//! ACME challenge responder, health endpoint, HTTP→HTTPS redirect, OIDC
//! callback and sign-out routes, per-route authentication, and finally the
//! host-based proxy hand-off. WebSocket upgrades are forwarded verbatim
//! and spliced byte-for-byte.

use crate::challenges::{ChallengeStore, ACME_CHALLENGE_PREFIX};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::oidc::{self, OidcAuthenticator, SIGNOUT_PATH};
use crate::routes::{Route, RouteTable};
use crate::upstream::{is_hop_by_hop, UpstreamPool};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HEALTH_PATH: &str = "/_health";

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Conservative per-request upstream deadline.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(100);

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Everything the request pipeline needs, shared across connections.
pub struct GatewayContext {
    pub routes: Arc<RouteTable>,
    pub challenges: ChallengeStore,
    pub oidc: Option<Arc<OidcAuthenticator>>,
    pub upstream: UpstreamPool,
    pub https_enabled: bool,
    pub redirect_http_to_https: bool,
    pub https_port: u16,
}

/// Serve one accepted connection (plaintext or decrypted TLS).
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr, is_tls).await }
    });

    // auto::Builder negotiates HTTP/1.1 and HTTP/2; upgrades stay available
    // on HTTP/1.1 connections.
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {e}"))?;

    Ok(())
}

/// The ordered middleware pipeline.
pub async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<GatewayContext>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();

    // ACME challenges answer before anything else so validation requests
    // are never redirected or authenticated.
    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        return Ok(match ctx.challenges.get(token) {
            Some(key_auth) => {
                debug!(token, "Answering ACME HTTP-01 challenge");
                text_response(StatusCode::OK, key_auth)
            }
            None => text_response(StatusCode::NOT_FOUND, "Unknown challenge token".to_string()),
        });
    }

    if path == HEALTH_PATH {
        return Ok(health_response(&ctx));
    }

    if !is_tls && ctx.https_enabled && ctx.redirect_http_to_https {
        return Ok(build_https_redirect(&req, ctx.https_port));
    }

    let scheme = if is_tls { "https" } else { "http" };
    let raw_host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let request_origin = format!("{scheme}://{raw_host}");

    if let Some(oidc) = ctx.oidc.as_ref() {
        if path == oidc.callback_path() {
            return Ok(oidc
                .handle_callback(&request_origin, req.uri().query(), is_tls)
                .await);
        }
        if path == SIGNOUT_PATH {
            return Ok(oidc.signout(is_tls));
        }
    }

    let Some(hostname) = extract_hostname(&req) else {
        return Ok(json_error_response(
            GatewayErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    let snapshot = ctx.routes.snapshot();
    let route = snapshot.route_for_host(&hostname).cloned();

    // Authentication gate, only for routes that asked for it.
    if let (Some(oidc), Some(route)) = (ctx.oidc.as_ref(), route.as_ref()) {
        if route.auth_required {
            match oidc.session_from_headers(req.headers()) {
                None => {
                    let return_path = req
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str())
                        .unwrap_or("/");
                    return Ok(oidc.challenge(&request_origin, return_path));
                }
                Some(session) => {
                    if !oidc::is_authorized(&session.roles, &route.required_roles) {
                        info!(
                            host = %hostname,
                            subject = %session.subject,
                            user_roles = ?session.roles,
                            required = ?route.required_roles,
                            "Denying request, required role missing"
                        );
                        return Ok(oidc::forbidden_response());
                    }
                }
            }
        }
    }

    let Some(route) = route else {
        return Ok(json_error_response(
            GatewayErrorCode::UnknownHost,
            format!("No route for host '{hostname}'"),
        ));
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    apply_forwarded_headers(&mut req, client_addr, is_tls, &request_id);

    debug!(
        host = %hostname,
        method = %req.method(),
        uri = %req.uri(),
        backend = %route.backend.authority(),
        request_id,
        "Proxying request"
    );

    if is_upgrade_request(&req) {
        return handle_upgrade(req, route, hostname, request_id).await;
    }

    let result = tokio::time::timeout(UPSTREAM_TIMEOUT, ctx.upstream.send(req, &route.backend)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(host = %hostname, backend = %route.backend.authority(), error = %e, "Backend request failed");
            Ok(json_error_response(
                GatewayErrorCode::UpstreamConnect,
                "Failed to reach the backend",
            ))
        }
        Err(_) => {
            warn!(
                host = %hostname,
                backend = %route.backend.authority(),
                timeout_secs = UPSTREAM_TIMEOUT.as_secs(),
                "Backend request timed out"
            );
            Ok(json_error_response(
                GatewayErrorCode::UpstreamTimeout,
                "The backend did not respond in time",
            ))
        }
    }
}

fn health_response(ctx: &GatewayContext) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "service": SERVICE_NAME,
        "status": "running",
        "version": VERSION,
        "https": ctx.https_enabled,
        "oidc": ctx.oidc.is_some(),
    })
    .to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn text_response(
    status: StatusCode,
    body: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// `X-Forwarded-For` is extended with the client address; proto and host
/// reflect this hop. The request id is propagated or freshly assigned.
fn apply_forwarded_headers<B>(
    req: &mut Request<B>,
    client_addr: SocketAddr,
    is_tls: bool,
    request_id: &str,
) {
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match req
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip,
    };

    let original_host = req.headers().get(hyper::header::HOST).cloned();

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
}

/// Host header, port stripped and lowercased. Rejects hostnames with
/// characters outside the DNS alphabet.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// 301 to the HTTPS equivalent, keeping path and query. The port appears
/// only when HTTPS runs somewhere other than 443.
fn build_https_redirect<B>(
    req: &Request<B>,
    https_port: u16,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{https_port}{path}")
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Connection: Upgrade plus an Upgrade header marks an upgrade request.
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Raw HTTP/1.1 upgrade request for the backend, headers forwarded
/// verbatim apart from hop-by-hop cleanup (Connection/Upgrade are re-added
/// since the upgrade must travel to the backend).
fn build_upgrade_request<B>(req: &Request<B>, backend_authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if is_hop_by_hop(name.as_str())
            && name != hyper::header::CONNECTION
            && name != hyper::header::UPGRADE
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{name}: {v}\r\n"));
        }
    }

    request.push_str(&format!("Host: {backend_authority}\r\n"));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's upgrade response head.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Splice client and backend until either side closes. Frames are never
/// parsed.
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, host: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                host,
                request_id,
                client_to_backend,
                backend_to_client,
                "WebSocket connection closed"
            );
        }
        Err(e) => {
            debug!(host, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Forward a WebSocket (or other protocol) upgrade to the backend.
async fn handle_upgrade(
    req: Request<Incoming>,
    route: Arc<Route>,
    host: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(host = %host, request_id, upgrade_type, "Handling upgrade request");

    let backend_authority = route.backend.authority();
    let raw_request = build_upgrade_request(&req, &backend_authority);

    let mut backend_stream = match TcpStream::connect(&backend_authority).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(host = %host, backend = %backend_authority, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamConnect,
                "Failed to reach the backend",
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(host = %host, error = %e, "Failed to send upgrade request to backend");
        return Ok(json_error_response(
            GatewayErrorCode::UpstreamConnect,
            "Failed to reach the backend",
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(host = %host, "Backend closed connection before answering the upgrade");
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamConnect,
                "Backend closed the connection",
            ));
        }
        Err(e) => {
            error!(host = %host, error = %e, "Failed to read upgrade response from backend");
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamConnect,
                "Failed to reach the backend",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        error!(host = %host, "Backend sent an unparseable upgrade response");
        return Ok(json_error_response(
            GatewayErrorCode::UpstreamConnect,
            "Invalid upgrade response from the backend",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host = %host, status = %status, "Backend rejected the upgrade");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(host = %host, request_id, upgrade_type, "WebSocket upgrade established");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, &host, &request_id).await;
            }
            Err(e) => {
                error!(host = %host, error = %e, "Failed to upgrade the client connection");
            }
        }
    });

    Ok(response)
}
