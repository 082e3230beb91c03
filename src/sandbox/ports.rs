use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A request to publish a container port, as supplied by the caller.
///
/// `host` is either absent, `"ip:port"`, or a bare numeric port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    #[serde(alias = "docker", alias = "container")]
    pub container_port: String,
    #[serde(default, alias = "local")]
    pub host: Option<String>,
}

impl PortRequest {
    pub fn new(container_port: impl Into<String>, host: Option<&str>) -> Self {
        Self {
            container_port: container_port.into(),
            host: host.map(str::to_string),
        }
    }
}

/// Resolved host side of a port binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HostPort {
    /// Let the runtime pick a host port.
    Auto,
    Port(u16),
    Address { ip: String, port: u16 },
}

impl HostPort {
    /// Parse a host spec. Anything that is not `ip:port` or a number resolves to `Auto`.
    pub fn parse(spec: Option<&str>) -> Self {
        let Some(spec) = spec.map(str::trim) else {
            return Self::Auto;
        };

        if let Some((ip, port)) = spec.rsplit_once(':') {
            return match port.parse() {
                Ok(port) => Self::Address {
                    ip: ip.to_string(),
                    port,
                },
                Err(_) => Self::Auto,
            };
        }

        spec.parse().map(Self::Port).unwrap_or(Self::Auto)
    }
}

/// Host bindings for one container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PortBinding {
    One(HostPort),
    /// Several host ports published for the same container port, in request order.
    Many(Vec<HostPort>),
}

impl PortBinding {
    pub fn hosts(&self) -> Vec<&HostPort> {
        match self {
            Self::One(host) => vec![host],
            Self::Many(hosts) => hosts.iter().collect(),
        }
    }

    fn push(&mut self, host: HostPort) {
        match self {
            Self::One(first) => {
                let first = std::mem::replace(first, HostPort::Auto);
                *self = Self::Many(vec![first, host]);
            }
            Self::Many(hosts) => hosts.push(host),
        }
    }
}

/// Container port (e.g. `"80"` or `"80/tcp"`) to its host bindings.
pub type PortMap = BTreeMap<String, PortBinding>;

/// Translate port requests into the runtime's port map.
pub fn translate_port_requests(requests: &[PortRequest]) -> PortMap {
    let mut ports = PortMap::new();

    for request in requests {
        let host = HostPort::parse(request.host.as_deref());
        match ports.get_mut(&request.container_port) {
            Some(binding) => binding.push(host),
            None => {
                ports.insert(request.container_port.clone(), PortBinding::One(host));
            }
        }
    }

    ports
}

/// Parse a CLI port flag of the form `container[:host]` or `container:ip:port`.
pub fn parse_port_flag(s: &str) -> Result<PortRequest, String> {
    let (container, host) = match s.split_once(':') {
        Some((container, host)) => (container, Some(host)),
        None => (s, None),
    };

    if container.is_empty() {
        return Err("Port format: container_port[:host_port]".to_string());
    }

    Ok(PortRequest::new(container, host))
}
