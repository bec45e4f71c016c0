//! Network front-end
//!
//! Binds the plaintext and TLS listeners. TLS handshakes are paused after
//! the ClientHello so the certificate for the advertised SNI name can be
//! looked up (or issued) asynchronously; a missing name or failed
//! acquisition aborts the handshake.

use crate::provider::CertificateManager;
use crate::proxy::{handle_connection, GatewayContext};
use anyhow::Context;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

/// Bind a listener socket, failing loudly; listeners must be up before the
/// observer starts feeding routes.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind listener on {addr}"))
}

/// Accept loop for the plaintext port.
pub async fn serve_plain(
    listener: TcpListener,
    ctx: Arc<GatewayContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "HTTP listener ready");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, ctx, false).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("HTTP listener shutting down");
                    return;
                }
            }
        }
    }
}

/// Accept loop for the TLS port.
pub async fn serve_tls(
    listener: TcpListener,
    ctx: Arc<GatewayContext>,
    certs: Arc<CertificateManager>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "HTTPS listener ready");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&ctx);
                        let certs = Arc::clone(&certs);
                        tokio::spawn(async move {
                            if let Err(e) = accept_tls(stream, addr, ctx, certs).await {
                                debug!(addr = %addr, error = %e, "TLS connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("HTTPS listener shutting down");
                    return;
                }
            }
        }
    }
}

/// Pause the handshake at the ClientHello, resolve a certificate for the
/// SNI name, then finish the handshake with a per-connection config.
async fn accept_tls(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    certs: Arc<CertificateManager>,
) -> anyhow::Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await.context("TLS ClientHello failed")?;

    let sni = start
        .client_hello()
        .server_name()
        .map(|name| name.to_lowercase());

    let Some(host) = sni else {
        debug!(addr = %addr, "No SNI in ClientHello, aborting handshake");
        return Ok(());
    };

    // May block on first-ever issuance; bounded by the issuer's polling
    // timeout. Pre-warming keeps this path rare.
    let record = match certs.acquire(&host).await {
        Ok(record) => record,
        Err(e) => {
            warn!(host = %host, addr = %addr, error = %e, "No certificate available, aborting handshake");
            return Ok(());
        }
    };

    let config = tls_config_for(Arc::clone(&record.certified));
    let tls_stream = start
        .into_stream(config)
        .await
        .context("TLS handshake failed")?;

    handle_connection(tls_stream, addr, ctx, true).await
}

fn tls_config_for(certified: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertResolver(certified)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// The certificate was already chosen from the ClientHello; every
/// resolution on this connection returns it.
#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}
