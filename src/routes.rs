//! Hot-swappable routing table
//!
//! A single copy-on-write cell maps host names to backend endpoints. The
//! observer is the only writer; request tasks read the current snapshot
//! without blocking. Each published snapshot carries a monotonically
//! increasing epoch, also broadcast on a watch channel for components that
//! cache derived state.

use crate::labels::short_id;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where traffic for a host is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl BackendEndpoint {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A live binding from one container to one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub container_id: String,
    pub name: String,
    pub host: String,
    pub backend: BackendEndpoint,
    pub tls: bool,
    pub auth_required: bool,
    pub required_roles: BTreeSet<String>,
}

/// Immutable view of the route table.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    by_host: HashMap<String, Arc<Route>>,
    by_container: HashMap<String, Arc<Route>>,
    epoch: u64,
}

impl RouteSnapshot {
    pub fn route_for_host(&self, host: &str) -> Option<&Arc<Route>> {
        self.by_host.get(host)
    }

    pub fn route_for_container(&self, container_id: &str) -> Option<&Arc<Route>> {
        self.by_container.get(container_id)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.by_host.keys().map(String::as_str)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.by_container.values()
    }

    pub fn len(&self) -> usize {
        self.by_container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_container.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Concurrent route table with snapshot semantics.
pub struct RouteTable {
    current: RwLock<Arc<RouteSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl RouteTable {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(RouteSnapshot::default())),
            epoch_tx,
        }
    }

    /// Current snapshot. Safe on the hot request path.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Subscribe to epoch changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Insert or replace the route owned by `route.container_id`.
    ///
    /// If a different container currently owns the same host, that route is
    /// displaced; the last writer wins, mirroring container lifecycle order.
    pub fn upsert(&self, route: Route) {
        let mut guard = self.current.write();
        let old = guard.as_ref();

        let mut by_host = old.by_host.clone();
        let mut by_container = old.by_container.clone();

        if let Some(previous) = by_host.get(&route.host) {
            if previous.container_id != route.container_id {
                warn!(
                    host = %route.host,
                    displaced = %short_id(&previous.container_id),
                    winner = %short_id(&route.container_id),
                    "Host claimed by a newer container, displacing existing route"
                );
                by_container.remove(&previous.container_id);
            }
        }

        // Drop any stale host entry from a previous version of this container.
        if let Some(previous) = by_container.get(&route.container_id) {
            if previous.host != route.host {
                by_host.remove(&previous.host);
            }
        }

        info!(
            container = %short_id(&route.container_id),
            host = %route.host,
            backend = %route.backend.authority(),
            tls = route.tls,
            auth = route.auth_required,
            "Route registered"
        );

        let route = Arc::new(route);
        by_host.insert(route.host.clone(), Arc::clone(&route));
        by_container.insert(route.container_id.clone(), route);

        self.publish(&mut guard, by_host, by_container);
    }

    /// Remove the route owned by `container_id`, if any.
    pub fn remove(&self, container_id: &str) {
        let mut guard = self.current.write();
        let old = guard.as_ref();

        let Some(route) = old.by_container.get(container_id) else {
            return;
        };

        let mut by_host = old.by_host.clone();
        let mut by_container = old.by_container.clone();

        // Only drop the host entry if this container still owns it; a
        // displaced container must not take the winner's host with it.
        if by_host
            .get(&route.host)
            .is_some_and(|r| r.container_id == container_id)
        {
            by_host.remove(&route.host);
        }
        let removed = by_container.remove(container_id);

        if let Some(route) = removed {
            info!(
                container = %short_id(container_id),
                host = %route.host,
                "Route removed"
            );
        }

        self.publish(&mut guard, by_host, by_container);
    }

    fn publish(
        &self,
        guard: &mut Arc<RouteSnapshot>,
        by_host: HashMap<String, Arc<Route>>,
        by_container: HashMap<String, Arc<Route>>,
    ) {
        let epoch = guard.epoch + 1;
        *guard = Arc::new(RouteSnapshot {
            by_host,
            by_container,
            epoch,
        });
        let _ = self.epoch_tx.send(epoch);
        debug!(epoch, routes = guard.len(), "Route table published");
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
