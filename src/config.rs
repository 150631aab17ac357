//! Configuration types for binder-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::BinderError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Directory (ZooKeeper) configuration.
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Cross-datacenter recursion. Disabled when absent.
    #[serde(default)]
    pub recursion: Option<RecursionConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Check cross-field requirements.
    pub fn validate(&self) -> Result<(), BinderError> {
        self.directory.root_domain(&self.dns)?;
        if self.recursion.is_some() {
            if self.dns.dns_domain.is_none() {
                return Err(BinderError::Config(
                    "recursion requires dns.dns_domain".into(),
                ));
            }
            if self.dns.datacenter_name.is_none() {
                return Err(BinderError::Config(
                    "recursion requires dns.datacenter_name".into(),
                ));
            }
        }
        Ok(())
    }
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for DNS server to listen on (UDP and TCP).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Zone suffix this server answers for (e.g., "joyent.us").
    /// Names outside it get a root referral.
    #[serde(default)]
    pub dns_domain: Option<String>,

    /// Name of the local datacenter (e.g., "us-east-1").
    #[serde(default)]
    pub datacenter_name: Option<String>,

    /// BIND hints file; the built-in copy is used when unset.
    #[serde(default)]
    pub root_hints: Option<PathBuf>,

    /// Idle timeout for TCP connections in seconds.
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            dns_domain: None,
            datacenter_name: None,
            root_hints: None,
            tcp_idle_timeout_secs: default_tcp_idle_timeout_secs(),
        }
    }
}

impl DnsConfig {
    /// TCP idle timeout as a duration.
    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }
}

/// Directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Ensemble members as `host:port`.
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    /// Domain whose subtree is mirrored. Defaults to `dns.dns_domain`.
    #[serde(default)]
    pub root_domain: Option<String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            root_domain: None,
        }
    }
}

impl DirectoryConfig {
    /// Comma-separated connect string.
    pub fn connect_string(&self) -> String {
        self.servers.join(",")
    }

    /// The mirrored root domain.
    pub fn root_domain(&self, dns: &DnsConfig) -> Result<String, BinderError> {
        self.root_domain
            .as_ref()
            .or(dns.dns_domain.as_ref())
            .cloned()
            .ok_or_else(|| {
                BinderError::Config(
                    "one of directory.root_domain or dns.dns_domain is required".into(),
                )
            })
    }
}

/// Cross-datacenter recursion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursionConfig {
    /// Region whose resolvers are listed.
    pub region_name: String,

    /// Where the resolver listing is served.
    pub backend: BackendConfig,

    /// Concurrent forward lookups.
    #[serde(default = "default_forward_concurrency")]
    pub forward_concurrency: usize,

    /// Concurrent PTR fan-out lookups.
    #[serde(default = "default_reverse_concurrency")]
    pub reverse_concurrency: usize,

    /// Upstreams asked at once for one PTR query.
    #[serde(default = "default_reverse_fanout")]
    pub reverse_fanout: usize,

    /// Upstream errors tolerated for one PTR query before giving up.
    #[serde(default = "default_reverse_error_threshold")]
    pub reverse_error_threshold: usize,

    /// Port upstream resolvers listen on.
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// Per-request deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between resolver list refreshes in seconds.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Delay between failed initialisation attempts in seconds.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl RecursionConfig {
    /// A configuration with defaults for everything but the region and backend.
    pub fn new(region_name: impl Into<String>, backend: BackendConfig) -> Self {
        Self {
            region_name: region_name.into(),
            backend,
            forward_concurrency: default_forward_concurrency(),
            reverse_concurrency: default_reverse_concurrency(),
            reverse_fanout: default_reverse_fanout(),
            reverse_error_threshold: default_reverse_error_threshold(),
            upstream_port: default_upstream_port(),
            timeout_ms: default_timeout_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }

    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interval between refreshes.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Delay between failed initialisation attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Resolver listing backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Directory name of the backend (e.g., "ufds.us-east-1.joyent.us").
    pub domain: String,

    /// HTTP port.
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Listing path.
    #[serde(default = "default_backend_path")]
    pub path: String,

    /// Deadline for one listing request in milliseconds, connect included.
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

impl BackendConfig {
    /// A backend at `domain` with the default port, path and timeout.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            port: default_backend_port(),
            path: default_backend_path(),
            timeout_ms: default_backend_timeout_ms(),
        }
    }

    /// Deadline for one listing request.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "binder_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_tcp_idle_timeout_secs() -> u64 {
    30
}

fn default_servers() -> Vec<String> {
    vec!["127.0.0.1:2181".to_string()]
}

fn default_forward_concurrency() -> usize {
    10
}

fn default_reverse_concurrency() -> usize {
    100
}

fn default_reverse_fanout() -> usize {
    4
}

fn default_reverse_error_threshold() -> usize {
    3
}

fn default_upstream_port() -> u16 {
    53
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_retry_interval_secs() -> u64 {
    15
}

fn default_backend_port() -> u16 {
    80
}

fn default_backend_path() -> String {
    "/resolvers".to_string()
}

fn default_backend_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}
