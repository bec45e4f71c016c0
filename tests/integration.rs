//! Integration tests driving the gateway over real sockets
//!
//! A fake container source stands in for the Docker daemon; backends are
//! in-process hyper servers. Requests go through plain TCP streams so the
//! whole listener/pipeline/proxy path is exercised.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use harborgate::challenges::ChallengeStore;
use harborgate::docker::{
    ContainerAction, ContainerDescriptor, ContainerEvent, ContainerSource, NetworkAttachment,
};
use harborgate::observer::ContainerObserver;
use harborgate::proxy::GatewayContext;
use harborgate::routes::RouteTable;
use harborgate::server;
use harborgate::upstream::UpstreamPool;

/// Scripted container engine.
struct FakeSource {
    containers: Mutex<HashMap<String, ContainerDescriptor>>,
    events_tx: tokio::sync::broadcast::Sender<ContainerEvent>,
}

impl FakeSource {
    fn new() -> Arc<Self> {
        let (events_tx, _) = tokio::sync::broadcast::channel(16);
        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            events_tx,
        })
    }

    fn start_container(&self, descriptor: ContainerDescriptor) {
        let id = descriptor.id.clone();
        self.containers.lock().insert(id.clone(), descriptor);
        let _ = self.events_tx.send(ContainerEvent {
            id,
            action: ContainerAction::Start,
        });
    }

    fn stop_container(&self, id: &str) {
        self.containers.lock().remove(id);
        let _ = self.events_tx.send(ContainerEvent {
            id: id.to_string(),
            action: ContainerAction::Stop,
        });
    }
}

#[async_trait]
impl ContainerSource for FakeSource {
    async fn list(&self) -> anyhow::Result<Vec<ContainerDescriptor>> {
        Ok(self.containers.lock().values().cloned().collect())
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<Option<ContainerDescriptor>> {
        Ok(self.containers.lock().get(id).cloned())
    }

    async fn events(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<ContainerEvent>>> {
        let rx = self.events_tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(_) => None,
            }
        });
        Ok(stream.boxed())
    }
}

/// A container whose labelled port 80 is published on `backend_port`.
fn labelled_container(id: &str, host: &str, backend_port: u16) -> ContainerDescriptor {
    let mut labels = HashMap::new();
    labels.insert("harborgate.enable".to_string(), "true".to_string());
    labels.insert("harborgate.host".to_string(), host.to_string());

    let mut host_bindings = HashMap::new();
    host_bindings.insert(80, backend_port);

    ContainerDescriptor {
        id: id.to_string(),
        name: format!("test-{id}"),
        labels,
        exposed_ports: vec![80],
        host_bindings,
        networks: vec![NetworkAttachment {
            name: "bridge".to_string(),
            ip: "172.17.0.2".to_string(),
        }],
    }
}

/// In-process HTTP backend answering every request with a hostname banner.
async fn spawn_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|_req| async {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(
                        "Hostname: mock-backend\n",
                    ))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    port
}

/// Raw TCP backend that accepts an HTTP upgrade and then echoes every byte.
async fn spawn_ws_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // Consume the request head.
                let mut buf = vec![0u8; 4096];
                let mut head = Vec::new();
                loop {
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let response = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
                if stream.write_all(response).await.is_err() {
                    return;
                }

                // Echo until the peer closes.
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

struct TestGateway {
    port: u16,
    source: Arc<FakeSource>,
    challenges: ChallengeStore,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn start_gateway(redirect_http_to_https: bool) -> TestGateway {
    let source = FakeSource::new();
    let routes = Arc::new(RouteTable::new());
    let challenges = ChallengeStore::new();

    let ctx = Arc::new(GatewayContext {
        routes: Arc::clone(&routes),
        challenges: challenges.clone(),
        oidc: None,
        upstream: UpstreamPool::new(),
        https_enabled: redirect_http_to_https,
        redirect_http_to_https,
        https_port: 443,
    });

    let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::serve_plain(listener, ctx, shutdown_rx.clone()));

    let observer = ContainerObserver::new(
        Arc::clone(&source) as Arc<dyn ContainerSource>,
        routes,
        false,
    );
    tokio::spawn(async move { observer.run(shutdown_rx).await });

    TestGateway {
        port,
        source,
        challenges,
        shutdown_tx,
    }
}

/// Raw HTTP/1.1 request with an explicit Host header.
async fn http_get(port: u16, path: &str, host: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response).await;
    response
}

/// Poll until the response matches, within the observer's settling window.
async fn wait_for_response<F>(port: u16, path: &str, host: &str, predicate: F) -> String
where
    F: Fn(&str) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let response = http_get(port, path, host).await;
        if predicate(&response) {
            return response;
        }
        if std::time::Instant::now() > deadline {
            panic!("response did not converge: {response}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn routes_by_host_header() {
    let backend_port = spawn_backend().await;
    let gateway = start_gateway(false).await;

    gateway
        .source
        .start_container(labelled_container("c-app1", "app1.test.local", backend_port));

    let response =
        wait_for_response(gateway.port, "/", "app1.test.local", |r| r.contains("200")).await;
    assert!(response.contains("Hostname:"));

    let response = http_get(gateway.port, "/", "unknown.test.local").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn explicit_port_label_routes() {
    let backend_port = spawn_backend().await;
    let gateway = start_gateway(false).await;

    let mut descriptor = labelled_container("c-app2", "app2.test.local", backend_port);
    descriptor
        .labels
        .insert("harborgate.port".to_string(), "80".to_string());
    gateway.source.start_container(descriptor);

    let response =
        wait_for_response(gateway.port, "/", "app2.test.local", |r| r.contains("200")).await;
    assert!(response.contains("Hostname:"));
}

#[tokio::test]
async fn dynamic_add_and_remove() {
    let backend_port = spawn_backend().await;
    let gateway = start_gateway(false).await;

    // Not yet started: 404.
    let response = http_get(gateway.port, "/", "dyn.test.local").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    gateway
        .source
        .start_container(labelled_container("c-dyn", "dyn.test.local", backend_port));
    wait_for_response(gateway.port, "/", "dyn.test.local", |r| r.contains("200")).await;

    gateway.source.stop_container("c-dyn");
    wait_for_response(gateway.port, "/", "dyn.test.local", |r| {
        r.starts_with("HTTP/1.1 404")
    })
    .await;
}

#[tokio::test]
async fn missing_host_header_is_rejected() {
    let gateway = start_gateway(false).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", gateway.port))
        .await
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: bad host!\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response).await;

    assert!(response.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn health_endpoint_reports_status() {
    let gateway = start_gateway(false).await;

    let response = http_get(gateway.port, "/_health", "anything.test").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"running\""));
    assert!(response.contains("\"service\":\"harborgate\""));
    assert!(response.contains("\"oidc\":false"));
}

#[tokio::test]
async fn acme_challenge_responder() {
    let gateway = start_gateway(false).await;

    gateway
        .challenges
        .add("tok-1".to_string(), "tok-1.key-auth".to_string());

    let response = http_get(
        gateway.port,
        "/.well-known/acme-challenge/tok-1",
        "any.test",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("tok-1.key-auth"));

    let response = http_get(
        gateway.port,
        "/.well-known/acme-challenge/other",
        "any.test",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn https_redirect_excludes_acme_and_health() {
    let gateway = start_gateway(true).await;
    gateway
        .challenges
        .add("tok-2".to_string(), "tok-2.key-auth".to_string());

    // Ordinary traffic is redirected with the original path and query.
    let response = http_get(gateway.port, "/some/path?q=1", "app.test").await;
    assert!(response.starts_with("HTTP/1.1 301"));
    assert!(response.contains("location: https://app.test/some/path?q=1")
        || response.contains("Location: https://app.test/some/path?q=1"));

    // ACME challenges and health are answered in place.
    let response = http_get(
        gateway.port,
        "/.well-known/acme-challenge/tok-2",
        "app.test",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("tok-2.key-auth"));

    let response = http_get(gateway.port, "/_health", "app.test").await;
    assert!(response.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn websocket_upgrade_round_trip() {
    let ws_port = spawn_ws_echo_backend().await;
    let gateway = start_gateway(false).await;

    gateway
        .source
        .start_container(labelled_container("c-ws", "ws.test.local", ws_port));

    let upgrade = "GET /socket HTTP/1.1\r\n\
                   Host: ws.test.local\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: websocket\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";

    // Retry the upgrade until the observer has registered the route.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    let mut stream = loop {
        let mut candidate = TcpStream::connect(format!("127.0.0.1:{}", gateway.port))
            .await
            .unwrap();
        candidate.write_all(upgrade.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = candidate.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before upgrade completed");
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let head_text = String::from_utf8_lossy(&head).into_owned();
        if head_text.starts_with("HTTP/1.1 101") {
            break candidate;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "upgrade never succeeded: {head_text}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    // Bytes pass through unmodified, repeatedly.
    for round in 0..5 {
        let message = format!("Hello WebSocket! #{round}");
        stream.write_all(message.as_bytes()).await.unwrap();

        let mut received = vec![0u8; message.len()];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, message.as_bytes());
    }
}

#[tokio::test]
async fn displaced_route_follows_latest_container() {
    let backend_port = spawn_backend().await;
    let gateway = start_gateway(false).await;

    gateway
        .source
        .start_container(labelled_container("c-old", "shared.test.local", backend_port));
    wait_for_response(gateway.port, "/", "shared.test.local", |r| r.contains("200")).await;

    // A newer container claims the same host; traffic follows it.
    let second_port = spawn_backend().await;
    gateway
        .source
        .start_container(labelled_container("c-new", "shared.test.local", second_port));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let response = http_get(gateway.port, "/", "shared.test.local").await;
    assert!(response.contains("200"));

    // Removing the displaced container must not take the host down.
    gateway.source.stop_container("c-old");
    tokio::time::sleep(Duration::from_secs(1)).await;
    let response = http_get(gateway.port, "/", "shared.test.local").await;
    assert!(response.contains("200"));
}
