use crate::loadbalancer::LoadBalanceStrategy;
use crate::pool::PoolConfig;
use crate::routing::{RouteDefaults, DEFAULT_HOST_SUFFIX};
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container discovery and route defaults
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Forwarding behaviour
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 443, set to 0 to disable)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Path to TLS certificate file (PEM format). A self-signed one is generated when unset.
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Force redirect from HTTP to HTTPS (default: false)
    #[serde(default)]
    pub force_https: bool,

    /// Docker daemon address, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`
    pub docker_host: Option<String>,
}

impl ServerConfig {
    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        self.tls_port
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            tls_port: default_tls_port(),
            tls_cert: None,
            tls_key: None,
            force_https: false,
            docker_host: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// How often the container list is polled, in milliseconds (minimum 100)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Suffix stripped from hostnames before lookup
    #[serde(default = "default_host_suffix")]
    pub host_suffix: String,

    /// Scheme used when a container has no scheme label
    #[serde(default = "default_scheme")]
    pub default_scheme: String,

    /// Port used when a container has no port label (https defaults to 443 regardless)
    #[serde(default = "default_backend_port")]
    pub default_port: u16,

    /// Network used when a container has no network label
    #[serde(default = "default_network")]
    pub default_network: String,
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn route_defaults(&self) -> RouteDefaults {
        RouteDefaults {
            scheme: self.default_scheme.to_lowercase(),
            port: self.default_port,
            network: self.default_network.clone(),
            host_suffix: self.host_suffix.clone(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            host_suffix: default_host_suffix(),
            default_scheme: default_scheme(),
            default_port: default_backend_port(),
            default_network: default_network(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Max time to wait for backend response headers, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// How to pick among containers sharing a hostname
    #[serde(default)]
    pub balance: LoadBalanceStrategy,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            balance: LoadBalanceStrategy::default(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_host_suffix() -> String {
    DEFAULT_HOST_SUFFIX.to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_backend_port() -> u16 {
    80
}

fn default_network() -> String {
    "bridge".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let suffix = &self.discovery.host_suffix;
        if !suffix.is_empty() && !suffix.starts_with('.') {
            errors.push(format!("discovery.host_suffix '{}' must start with '.'", suffix));
        }

        if self.discovery.default_port == 0 {
            errors.push("discovery.default_port must be greater than 0".to_string());
        }

        if self.discovery.default_scheme.trim().is_empty() {
            errors.push("discovery.default_scheme must not be empty".to_string());
        }

        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than 0".to_string());
        }

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) => errors.push("server.tls_cert is set but server.tls_key is not".to_string()),
            (None, Some(_)) => errors.push("server.tls_key is set but server.tls_cert is not".to_string()),
            _ => {}
        }

        if self.server.port == 0 && self.server.tls_port == 0 {
            errors.push("server.port and server.tls_port are both 0, nothing to listen on".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
tls_port = 8443
bind = "127.0.0.1"
force_https = true
docker_host = "tcp://10.0.0.1:2375"

[discovery]
poll_interval_ms = 500
host_suffix = ".docker.test"
default_network = "web"

[proxy]
request_timeout_secs = 5
balance = "round-robin"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.https_port(), 8443);
        assert!(config.server.force_https);
        assert_eq!(config.server.docker_host.as_deref(), Some("tcp://10.0.0.1:2375"));
        assert_eq!(config.discovery.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.proxy.balance, LoadBalanceStrategy::RoundRobin);

        let defaults = config.discovery.route_defaults();
        assert_eq!(defaults.host_suffix, ".docker.test");
        assert_eq!(defaults.network, "web");
        assert_eq!(defaults.scheme, "http");
        assert_eq!(defaults.port, 80);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.http_port(), 80);
        assert_eq!(config.server.https_port(), 443);
        assert!(!config.server.has_tls_files());
        assert_eq!(config.discovery.poll_interval_ms, 1000);
        assert_eq!(config.discovery.host_suffix, ".indocker.app");
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.proxy.pool_config().max_idle_per_host, 10);
        assert_eq!(config.proxy.pool_config().idle_timeout, Duration::from_secs(90));
        assert_eq!(config.proxy.balance, LoadBalanceStrategy::Random);
        assert_eq!(config.discovery.route_defaults(), RouteDefaults::default());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 80);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_suffix_must_start_with_dot() {
        let config: Config = toml::from_str("[discovery]\nhost_suffix = \"indocker.app\"").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("host_suffix"));

        let config: Config = toml::from_str("[discovery]\nhost_suffix = \"\"").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_collected() {
        let toml = r#"
[server]
port = 0
tls_port = 0
tls_cert = "/etc/cert.pem"

[discovery]
default_port = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("default_port"));
        assert!(err.contains("tls_key is not"));
        assert!(err.contains("nothing to listen on"));
    }

    #[test]
    fn test_unknown_balance_strategy() {
        assert!(toml::from_str::<Config>("[proxy]\nbalance = \"least-connections\"").is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 80);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 8080\ntls_port = 0").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.https_port(), 0);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(Config::load(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[discovery]\ndefault_port = 0").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
