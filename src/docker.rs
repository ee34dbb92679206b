//! Container runtime access
//!
//! [`DockerApi`] is the seam between the discovery engine and the daemon. The
//! production implementation, [`DockerClient`], talks to Docker through bollard;
//! tests use `StubDocker` from the `testing` module (feature `testing`).

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, Stats, StatsOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Container states considered "alive"
pub const ALIVE_STATES: [&str; 5] = ["created", "restarting", "running", "removing", "paused"];

/// Daemon event classes that may change routing
pub const ROUTING_EVENT_TYPES: [&str; 4] = ["container", "network", "daemon", "service"];

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),
    #[error("cannot connect to docker: {0}")]
    Connect(String),
    #[error("no stats sample returned for container {0}")]
    NoStats(String),
    #[error("{0}")]
    Other(String),
}

/// One network a container is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkEndpoint {
    pub ip_address: String,
}

/// One container as reported by the daemon's list call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub labels: HashMap<String, String>,
    /// Attached networks keyed by network name
    pub networks: HashMap<String, NetworkEndpoint>,
}

impl ContainerRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_network(mut self, name: &str, ip_address: &str) -> Self {
        self.networks.insert(
            name.to_string(),
            NetworkEndpoint {
                ip_address: ip_address.to_string(),
            },
        );
        self
    }

    fn from_summary(summary: ContainerSummary) -> Option<Self> {
        let id = summary.id?;
        let networks = summary
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, endpoint)| {
                (
                    name,
                    NetworkEndpoint {
                        ip_address: endpoint.ip_address.unwrap_or_default(),
                    },
                )
            })
            .collect();

        Some(Self {
            id,
            labels: summary.labels.unwrap_or_default(),
            networks,
        })
    }
}

/// A single resource-usage sample for one container
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// Sample timestamp as reported by the daemon
    pub read: String,
    pub cpu_total_usage: u64,
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u64>,
    /// CPU usage since the previous sample, 100.0 per fully used core
    pub cpu_percent: f64,
    pub memory_usage: Option<u64>,
    pub memory_limit: Option<u64>,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub pids: Option<u64>,
}

impl From<Stats> for ResourceUsage {
    fn from(stats: Stats) -> Self {
        let online_cpus = stats.cpu_stats.online_cpus;
        let cpu_percent = cpu_percent(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.precpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage,
            stats.precpu_stats.system_cpu_usage,
            online_cpus.unwrap_or(1),
        );

        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or_default();

        Self {
            read: stats.read,
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
            system_cpu_usage: stats.cpu_stats.system_cpu_usage,
            online_cpus,
            cpu_percent,
            memory_usage: stats.memory_stats.usage,
            memory_limit: stats.memory_stats.limit,
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            pids: stats.pids_stats.current,
        }
    }
}

/// Same formula as `docker stats`
fn cpu_percent(
    total: u64,
    pre_total: u64,
    system: Option<u64>,
    pre_system: Option<u64>,
    online_cpus: u64,
) -> f64 {
    let (Some(system), Some(pre_system)) = (system, pre_system) else {
        return 0.0;
    };
    let cpu_delta = total.saturating_sub(pre_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;

    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    cpu_delta / system_delta * online_cpus.max(1) as f64 * 100.0
}

/// A daemon event, reduced to what the router logs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonEvent {
    pub kind: String,
    pub action: String,
    pub actor_id: Option<String>,
}

impl From<EventMessage> for DaemonEvent {
    fn from(msg: EventMessage) -> Self {
        Self {
            kind: msg
                .typ
                .map(|t| format!("{:?}", t).to_lowercase())
                .unwrap_or_default(),
            action: msg.action.unwrap_or_default(),
            actor_id: msg.actor.and_then(|a| a.id),
        }
    }
}

/// Operations the discovery engine needs from the container runtime
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// List containers in one of the [`ALIVE_STATES`]
    async fn list_alive_containers(&self) -> Result<Vec<ContainerRecord>, DockerError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError>;

    /// Take one non-streaming stats sample
    async fn container_stats(&self, id: &str) -> Result<ResourceUsage, DockerError>;

    /// Open the daemon event stream, filtered to [`ROUTING_EVENT_TYPES`]
    fn events(&self) -> BoxStream<'static, Result<DaemonEvent, DockerError>>;
}

/// bollard-backed runtime client
#[derive(Clone)]
pub struct DockerClient {
    client: Docker,
}

const CONNECT_TIMEOUT_SECS: u64 = 120;

impl DockerClient {
    /// Connect and ping the daemon.
    ///
    /// `docker_host` wins over `DOCKER_HOST`; with neither set, well-known
    /// socket locations are probed before falling back to bollard's defaults.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let explicit = docker_host
            .map(str::to_string)
            .or_else(|| std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty()));

        let client = match explicit {
            Some(host) => Self::connect_to_host(&host)
                .with_context(|| format!("Failed to connect to Docker at '{}'", host))?,
            None => Self::probe_sockets().await?,
        };

        client
            .ping()
            .await
            .context("Docker daemon is not responding, is dockerd running?")?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// `unix:///path` or `tcp://host:port`
    fn connect_to_host(host: &str) -> Result<Docker, DockerError> {
        if let Some(path) = host.strip_prefix("unix://") {
            Ok(Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Ok(Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?)
        } else {
            Err(DockerError::Connect(format!(
                "unsupported docker_host '{}', use unix:// or tcp://",
                host
            )))
        }
    }

    async fn probe_sockets() -> anyhow::Result<Docker> {
        let mut candidates = vec![PathBuf::from("/var/run/docker.sock")];
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            candidates.push(home.join(".docker/run/docker.sock"));
            candidates.push(home.join(".colima/default/docker.sock"));
        }
        if let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from) {
            candidates.push(runtime.join("docker.sock"));
            candidates.push(runtime.join("podman/podman.sock"));
        }

        for path in candidates.iter().filter(|p| p.exists()) {
            let Some(path) = path.to_str() else { continue };
            match Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
                Ok(client) if client.ping().await.is_ok() => {
                    debug!(path, "Using Docker socket");
                    return Ok(client);
                }
                Ok(_) => debug!(path, "Socket exists but daemon is not answering"),
                Err(e) => debug!(path, error = %e, "Socket connection failed"),
            }
        }

        Docker::connect_with_socket_defaults().context(
            "Cannot connect to Docker daemon. Start dockerd, or set DOCKER_HOST or server.docker_host",
        )
    }
}

fn filters(key: &str, values: &[&str]) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert(
        key.to_string(),
        values.iter().map(|v| v.to_string()).collect(),
    );
    filters
}

#[async_trait]
impl DockerApi for DockerClient {
    async fn list_alive_containers(&self) -> Result<Vec<ContainerRecord>, DockerError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: filters("status", &ALIVE_STATES),
            ..Default::default()
        };

        let list = self.client.list_containers(Some(options)).await?;
        Ok(list.into_iter().filter_map(ContainerRecord::from_summary).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        Ok(self.client.inspect_container(id, None).await?)
    }

    async fn container_stats(&self, id: &str) -> Result<ResourceUsage, DockerError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.client.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(ResourceUsage::from(stats)),
            Some(Err(e)) => Err(e.into()),
            None => Err(DockerError::NoStats(id.to_string())),
        }
    }

    fn events(&self) -> BoxStream<'static, Result<DaemonEvent, DockerError>> {
        let options = EventsOptions::<String> {
            filters: filters("type", &ROUTING_EVENT_TYPES),
            ..Default::default()
        };

        self.client
            .events(Some(options))
            .map(|item| item.map(DaemonEvent::from).map_err(DockerError::from))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerSummaryNetworkSettings, EndpointSettings};

    #[test]
    fn test_record_from_summary() {
        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.2".to_string()),
                ..Default::default()
            },
        );
        let mut labels = HashMap::new();
        labels.insert("indocker.host".to_string(), "whoami".to_string());

        let summary = ContainerSummary {
            id: Some("abc123".to_string()),
            labels: Some(labels),
            network_settings: Some(ContainerSummaryNetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = ContainerRecord::from_summary(summary).unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(record.labels.get("indocker.host").unwrap(), "whoami");
        assert_eq!(record.networks.get("bridge").unwrap().ip_address, "172.17.0.2");
    }

    #[test]
    fn test_record_without_id_is_skipped() {
        assert!(ContainerRecord::from_summary(ContainerSummary::default()).is_none());
    }

    #[test]
    fn test_record_without_networks() {
        let summary = ContainerSummary {
            id: Some("abc".to_string()),
            ..Default::default()
        };

        let record = ContainerRecord::from_summary(summary).unwrap();
        assert!(record.networks.is_empty());
        assert!(record.labels.is_empty());
    }

    #[test]
    fn test_cpu_percent() {
        // 50% of one core's share on a 2-core host
        let pct = cpu_percent(1_500, 1_000, Some(12_000), Some(10_000), 2);
        assert!((pct - 50.0).abs() < f64::EPSILON);

        assert_eq!(cpu_percent(1_000, 1_000, Some(2), Some(1), 4), 0.0);
        assert_eq!(cpu_percent(2_000, 1_000, None, Some(1), 4), 0.0);
    }

    #[test]
    fn test_connect_to_host_rejects_unknown_scheme() {
        let err = DockerClient::connect_to_host("ftp://nowhere").unwrap_err();
        assert!(err.to_string().contains("unsupported docker_host"));
    }
}
