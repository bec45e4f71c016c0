//! Container observer
//!
//! Drives the initial scan and the lifecycle event loop, translating engine
//! events into route table mutations. The observer is the route table's
//! only writer; engine failures are logged and never crash the task.

use crate::docker::{ContainerDescriptor, ContainerSource};
use crate::labels::{parse_labels, short_id, RouteIntent};
use crate::routes::{BackendEndpoint, Route, RouteTable};
use futures::StreamExt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Containers may publish ports a moment after `start` fires.
const START_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Event stream reconnect back-off bounds.
const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub struct ContainerObserver {
    source: Arc<dyn ContainerSource>,
    table: Arc<RouteTable>,
    /// When the gateway runs inside a container, backends are reached over
    /// the container network instead of published host ports.
    inside_container: bool,
    settle_delay: Duration,
}

impl ContainerObserver {
    pub fn new(
        source: Arc<dyn ContainerSource>,
        table: Arc<RouteTable>,
        inside_container: bool,
    ) -> Self {
        Self {
            source,
            table,
            inside_container,
            settle_delay: START_SETTLE_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Scan running containers, then follow the event stream until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        self.initial_scan().await;

        let mut backoff = RECONNECT_MIN;
        loop {
            let mut stream = match self.source.events().await {
                Ok(stream) => {
                    backoff = RECONNECT_MIN;
                    stream
                }
                Err(e) => {
                    error!(error = %e, retry_in_secs = backoff.as_secs_f32(), "Failed to open container event stream");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            };

            info!("Watching container lifecycle events");

            loop {
                tokio::select! {
                    event = stream.next() => {
                        match event {
                            Some(Ok(event)) => {
                                self.handle_event(&event.id, event.action.is_removal()).await;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Container event stream error, reconnecting");
                                break;
                            }
                            None => {
                                warn!("Container event stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Container observer shutting down");
                            return;
                        }
                    }
                }
            }

            // Re-scan after a broken stream; events may have been missed.
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
            self.initial_scan().await;
        }
    }

    async fn initial_scan(&self) {
        match self.source.list().await {
            Ok(descriptors) => {
                info!(containers = descriptors.len(), "Scanning running containers");
                for descriptor in descriptors {
                    self.apply_descriptor(descriptor);
                }
            }
            Err(e) => {
                error!(error = %e, "Initial container scan failed, continuing with empty route table");
            }
        }
    }

    async fn handle_event(&self, id: &str, removal: bool) {
        if removal {
            debug!(container = %short_id(id), "Container stopped");
            self.table.remove(id);
            return;
        }

        tokio::time::sleep(self.settle_delay).await;

        match self.source.inspect(id).await {
            Ok(Some(descriptor)) => self.apply_descriptor(descriptor),
            Ok(None) => {
                debug!(container = %short_id(id), "Container vanished before inspection");
                self.table.remove(id);
            }
            Err(e) => {
                warn!(container = %short_id(id), error = %e, "Inspect failed, skipping container");
            }
        }
    }

    fn apply_descriptor(&self, descriptor: ContainerDescriptor) {
        let intent = parse_labels(&descriptor.id, &descriptor.labels);
        if !intent.is_routable() {
            // A re-inspected container may have dropped its labels.
            self.table.remove(&descriptor.id);
            return;
        }

        match derive_route(&descriptor, &intent, self.inside_container) {
            Some(route) => self.table.upsert(route),
            None => self.table.remove(&descriptor.id),
        }
    }
}

/// Derive the backend endpoint for a routable container, or `None` (with a
/// WARN log) when the container cannot be reached.
pub fn derive_route(
    descriptor: &ContainerDescriptor,
    intent: &RouteIntent,
    inside_container: bool,
) -> Option<Route> {
    let host = intent.host.clone()?;
    let container = short_id(&descriptor.id);

    let target_port = match intent.port {
        Some(port) => port,
        None => {
            if descriptor.exposed_ports.len() > 1 {
                warn!(
                    container = %container,
                    host = %host,
                    ports = ?descriptor.exposed_ports,
                    "Multiple exposed ports without an explicit port label, using the lowest"
                );
            }
            match descriptor.exposed_ports.first() {
                Some(port) => *port,
                None => {
                    warn!(container = %container, host = %host, "No target port discoverable, skipping container");
                    return None;
                }
            }
        }
    };

    let backend = if inside_container {
        let Some(attachment) = descriptor.networks.first() else {
            warn!(container = %container, host = %host, "Container has no network attachment, skipping");
            return None;
        };
        let Ok(address) = attachment.ip.parse::<IpAddr>() else {
            warn!(
                container = %container,
                host = %host,
                ip = %attachment.ip,
                "Container network address is not an IP literal, skipping"
            );
            return None;
        };
        BackendEndpoint {
            address,
            port: target_port,
        }
    } else {
        let Some(host_port) = descriptor.host_bindings.get(&target_port) else {
            warn!(
                container = %container,
                host = %host,
                port = target_port,
                "No published host binding for target port, skipping container"
            );
            return None;
        };
        BackendEndpoint {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: *host_port,
        }
    };

    Some(Route {
        container_id: descriptor.id.clone(),
        name: descriptor.name.clone(),
        host,
        backend,
        tls: intent.tls,
        auth_required: intent.auth_required,
        required_roles: intent.required_roles.clone(),
    })
}
