//! Container label parsing
//!
//! Containers opt into routing through labels under the `harborgate.`
//! prefix. Malformed values degrade to defaults and are logged; parsing
//! never fails.

use std::collections::BTreeSet;
use std::collections::HashMap;
use tracing::warn;

/// Reserved label prefix. The sole configuration surface on the container side.
pub const LABEL_PREFIX: &str = "harborgate.";

pub const LABEL_ENABLE: &str = "harborgate.enable";
pub const LABEL_HOST: &str = "harborgate.host";
pub const LABEL_PORT: &str = "harborgate.port";
pub const LABEL_TLS: &str = "harborgate.tls";
pub const LABEL_AUTH_ENABLE: &str = "harborgate.auth.enable";
pub const LABEL_AUTH_ROLES: &str = "harborgate.auth.roles";

/// Structured routing intent derived from a container's labels.
///
/// Rebuilt from scratch on every inspection; never stored long-term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteIntent {
    pub enable: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: bool,
    pub auth_required: bool,
    pub required_roles: BTreeSet<String>,
}

impl RouteIntent {
    /// An intent is routable when it is enabled and names a host.
    pub fn is_routable(&self) -> bool {
        self.enable && self.host.is_some()
    }
}

/// Parse a container's label map into a `RouteIntent`.
///
/// `container_id` is only used for log context.
pub fn parse_labels(container_id: &str, labels: &HashMap<String, String>) -> RouteIntent {
    let short_id = short_id(container_id);

    let enable = labels
        .get(LABEL_ENABLE)
        .map(|v| parse_bool(v))
        .unwrap_or(false);

    let host = labels.get(LABEL_HOST).and_then(|v| {
        let trimmed = v.trim().to_lowercase();
        if trimmed.is_empty() {
            warn!(container = %short_id, "Empty host label, container will be ignored");
            None
        } else {
            Some(trimmed)
        }
    });

    let port = labels.get(LABEL_PORT).and_then(|v| {
        match v.trim().parse::<u16>() {
            Ok(p) if p > 0 => Some(p),
            _ => {
                warn!(container = %short_id, value = %v, "Invalid port label, falling back to exposed ports");
                None
            }
        }
    });

    let tls = labels.get(LABEL_TLS).map(|v| parse_bool(v)).unwrap_or(true);

    let auth_required = labels
        .get(LABEL_AUTH_ENABLE)
        .map(|v| parse_bool(v))
        .unwrap_or(false);

    let required_roles = labels
        .get(LABEL_AUTH_ROLES)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    RouteIntent {
        enable,
        host,
        port,
        tls,
        auth_required,
        required_roles,
    }
}

/// Truthy values are "true", "1" and "yes", case-insensitive.
fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// First 12 characters of a container id, for log lines.
pub fn short_id(container_id: &str) -> &str {
    if container_id.len() > 12 {
        &container_id[..12]
    } else {
        container_id
    }
}
