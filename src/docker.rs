//! Container engine access
//!
//! The observer consumes the engine through the `ContainerSource` trait so
//! tests can substitute an in-memory implementation. The production
//! implementation talks to the Docker daemon via bollard.

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::labels::short_id;

/// Lifecycle actions the observer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Die,
    Stop,
    Destroy,
}

impl ContainerAction {
    fn from_event(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "die" => Some(Self::Die),
            "stop" => Some(Self::Stop),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }

    /// Actions that tear a route down rather than creating one.
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Die | Self::Stop | Self::Destroy)
    }
}

/// A lifecycle event for a single container.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub id: String,
    pub action: ContainerAction,
}

/// A network the container is attached to, with its address on that network.
#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    pub name: String,
    pub ip: String,
}

/// Everything route derivation needs to know about one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerDescriptor {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// TCP ports the image exposes, ascending.
    pub exposed_ports: Vec<u16>,
    /// Container port to published host port.
    pub host_bindings: HashMap<u16, u16>,
    /// Attached networks in engine iteration order.
    pub networks: Vec<NetworkAttachment>,
}

/// Capability set the observer depends on.
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// Snapshot of currently running containers.
    async fn list(&self) -> anyhow::Result<Vec<ContainerDescriptor>>;

    /// Inspect one container; `None` when the engine no longer knows it.
    async fn inspect(&self, id: &str) -> anyhow::Result<Option<ContainerDescriptor>>;

    /// Open the lifecycle event stream.
    async fn events(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<ContainerEvent>>>;
}

/// Docker-backed container source.
pub struct DockerSource {
    client: Docker,
}

impl DockerSource {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority: explicit host, then `DOCKER_HOST`, then the
    /// platform default socket.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .context("Cannot connect to Docker daemon at the default socket")?
        };

        client.ping().await.context(
            "Docker daemon is not responding. Ensure dockerd is running and the socket is accessible",
        )?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Cannot connect to Unix socket '{socket_path}'"))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Cannot connect to TCP endpoint '{host}'"))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn descriptor_from_inspect(
        response: bollard::models::ContainerInspectResponse,
    ) -> Option<ContainerDescriptor> {
        let id = response.id?;
        let name = response
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let config = response.config.unwrap_or_default();
        let labels = config.labels.unwrap_or_default();

        let mut exposed_ports: Vec<u16> = config
            .exposed_ports
            .unwrap_or_default()
            .keys()
            .filter_map(|key| parse_port_key(key))
            .collect();
        exposed_ports.sort_unstable();
        exposed_ports.dedup();

        let network_settings = response.network_settings.unwrap_or_default();

        let host_bindings: HashMap<u16, u16> = network_settings
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let container_port = parse_port_key(&key)?;
                let host_port = bindings?
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))?;
                Some((container_port, host_port))
            })
            .collect();

        let networks: Vec<NetworkAttachment> = network_settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, endpoint)| {
                let ip = endpoint.ip_address.filter(|ip| !ip.is_empty())?;
                Some(NetworkAttachment { name, ip })
            })
            .collect();

        Some(ContainerDescriptor {
            id,
            name,
            labels,
            exposed_ports,
            host_bindings,
            networks,
        })
    }
}

#[async_trait]
impl ContainerSource for DockerSource {
    async fn list(&self) -> anyhow::Result<Vec<ContainerDescriptor>> {
        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        let mut descriptors = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect(&id).await {
                Ok(Some(descriptor)) => descriptors.push(descriptor),
                Ok(None) => {}
                Err(e) => {
                    warn!(container = %short_id(&id), error = %e, "Failed to inspect container during scan");
                }
            }
        }
        Ok(descriptors)
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<Option<ContainerDescriptor>> {
        match self.client.inspect_container(id, None).await {
            Ok(response) => Ok(Self::descriptor_from_inspect(response)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to inspect container {}", short_id(id)))
            }
        }
    }

    async fn events(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<ContainerEvent>>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec![
                "start".to_string(),
                "die".to_string(),
                "stop".to_string(),
                "destroy".to_string(),
            ],
        );

        let stream = self
            .client
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|message| async move {
                match message {
                    Ok(event) => {
                        let id = event.actor.and_then(|a| a.id)?;
                        let action = event
                            .action
                            .as_deref()
                            .and_then(ContainerAction::from_event)?;
                        Some(Ok(ContainerEvent { id, action }))
                    }
                    Err(e) => Some(Err(anyhow::anyhow!("Event stream error: {e}"))),
                }
            })
            .boxed();

        Ok(stream)
    }
}

/// Parse the numeric part of an engine port key such as `"8080/tcp"`.
/// Non-TCP ports are ignored.
fn parse_port_key(key: &str) -> Option<u16> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    if proto != "tcp" {
        return None;
    }
    port.parse().ok()
}

/// True when the gateway itself runs inside a container; switches endpoint
/// derivation from published host ports to container network addresses.
pub fn running_in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
}
