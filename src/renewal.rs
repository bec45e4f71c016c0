//! Background certificate renewal
//!
//! Walks every host the certificate store knows and reissues records that
//! entered the renewal window. A failed renewal is logged and retried on
//! the next pass; the still-valid record keeps being served until its true
//! expiry.

use crate::provider::CertificateManager;
use crate::routes::RouteTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

const INITIAL_DELAY: Duration = Duration::from_secs(60);
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub struct RenewalLoop {
    manager: Arc<CertificateManager>,
    initial_delay: Duration,
    interval: Duration,
}

impl RenewalLoop {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self {
            manager,
            initial_delay: INITIAL_DELAY,
            interval: RENEWAL_INTERVAL,
        }
    }

    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.initial_delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        loop {
            self.renewal_pass().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Renewal loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One sweep over every known host.
    pub async fn renewal_pass(&self) {
        let hosts = self.manager.store().hosts();
        debug!(hosts = hosts.len(), "Checking certificates for renewal");

        for host in hosts {
            if !self.manager.needs_renewal(&host) {
                continue;
            }
            match self.manager.renew(&host).await {
                Ok(record) => {
                    info!(host = %host, not_after = record.not_after, "Certificate renewed");
                }
                Err(e) => {
                    // Keep serving the aging record; retry next pass.
                    error!(host = %host, error = %e, "Certificate renewal failed");
                }
            }
        }
    }
}

/// Acquire certificates in the background as TLS routes appear, so first
/// handshakes rarely have to wait for issuance.
pub async fn prewarm_certificates(
    table: Arc<RouteTable>,
    manager: Arc<CertificateManager>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut changes = table.changes();

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = table.snapshot();
                for route in snapshot.routes() {
                    if !route.tls || manager.store().get(&route.host).is_some() {
                        continue;
                    }
                    let host = route.host.clone();
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        debug!(host = %host, "Pre-warming certificate");
                        if let Err(e) = manager.acquire(&host).await {
                            error!(host = %host, error = %e, "Certificate pre-warm failed");
                        }
                    });
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}
