//! Configuration types for dyndns.

use hickory_proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DyndnsError;
use crate::reconciler::ReconcilerConfig;
use crate::state::StateMachineConfig;

/// Prefix of environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "DYNDNS";

/// Bounds of the client's resolve interval, in seconds.
const RESOLVE_INTERVAL_BOUNDS: std::ops::RangeInclusive<u64> = 10..=300;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration, required by `dyndns client`.
    #[serde(default)]
    pub client: Option<ClientConfig>,

    /// Server configuration, required by `dyndns server`.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load from a TOML file, overridden by `DYNDNS__*` environment variables.
    pub fn load(path: &Path) -> Result<Self, DyndnsError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host whose record this client maintains.
    pub host: String,

    /// Path of the signing keypair file, created if missing.
    pub keypair_path: PathBuf,

    /// Base interval between discovery ticks, in seconds.
    #[serde(default = "default_resolve_interval")]
    pub resolve_interval_secs: u64,

    /// Interval between ticks while DNS has not converged, in seconds.
    #[serde(default = "default_unconfirmed_interval")]
    pub unconfirmed_interval_secs: u64,

    /// Random jitter bound for the confirmed interval, 0 disables it.
    #[serde(default = "default_confirmed_jitter")]
    pub confirmed_jitter_secs: u64,

    /// Send an update on the first tick without consulting DNS.
    #[serde(default)]
    pub force_send_on_start: bool,

    /// Treat delivery through any one dispatcher as sufficient.
    #[serde(default)]
    pub stop_after_first_success: bool,

    /// Period of the delivery retry ticker, in seconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Timeout of a single delivery, in seconds.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,

    /// Name server consulted for convergence checks; system resolver if unset.
    #[serde(default)]
    pub lookup_nameserver: Option<SocketAddr>,

    /// Address discovery.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Named delivery channels.
    #[serde(default)]
    pub dispatchers: BTreeMap<String, DispatcherConfig>,
}

impl ClientConfig {
    /// Check bounds and required fields.
    pub fn validate(&self) -> Result<(), DyndnsError> {
        if self.host.is_empty() {
            return Err(DyndnsError::Config("client.host must not be empty".into()));
        }
        if self.keypair_path.as_os_str().is_empty() {
            return Err(DyndnsError::Config(
                "client.keypair_path must not be empty".into(),
            ));
        }
        if !RESOLVE_INTERVAL_BOUNDS.contains(&self.resolve_interval_secs) {
            return Err(DyndnsError::Config(format!(
                "client.resolve_interval_secs must be within {}..={}, got {}",
                RESOLVE_INTERVAL_BOUNDS.start(),
                RESOLVE_INTERVAL_BOUNDS.end(),
                self.resolve_interval_secs
            )));
        }
        for (name, value) in [
            ("unconfirmed_interval_secs", self.unconfirmed_interval_secs),
            ("retry_interval_secs", self.retry_interval_secs),
            ("dispatch_timeout_secs", self.dispatch_timeout_secs),
        ] {
            if value == 0 {
                return Err(DyndnsError::Config(format!("client.{} must be positive", name)));
            }
        }
        if self.dispatchers.is_empty() {
            return Err(DyndnsError::Config("no dispatchers configured".into()));
        }
        for (name, dispatcher) in &self.dispatchers {
            dispatcher.validate(name)?;
        }
        self.resolver.validate()
    }

    /// State machine tunables.
    pub fn state_machine(&self) -> StateMachineConfig {
        StateMachineConfig {
            resolve_interval: Duration::from_secs(self.resolve_interval_secs),
            unconfirmed_interval: Duration::from_secs(self.unconfirmed_interval_secs),
            confirmed_jitter: Duration::from_secs(self.confirmed_jitter_secs),
            force_send_on_start: self.force_send_on_start,
        }
    }

    /// Reconciler tunables.
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            stop_after_first_success: self.stop_after_first_success,
            dispatch_timeout: Duration::from_secs(self.dispatch_timeout_secs),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
        }
    }
}

/// Address discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResolverConfig {
    /// Fixed addresses.
    Static {
        /// IPv4 address to announce.
        #[serde(default)]
        ipv4: Option<Ipv4Addr>,
        /// IPv6 address to announce.
        #[serde(default)]
        ipv6: Option<Ipv6Addr>,
    },
    /// Public "what is my IP" HTTP services.
    Http {
        /// Providers for the IPv4 address; empty uses the built-in list.
        #[serde(default)]
        ipv4_urls: Vec<String>,
        /// Providers for the IPv6 address; empty uses the built-in list.
        #[serde(default)]
        ipv6_urls: Vec<String>,
    },
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig::Http {
            ipv4_urls: Vec::new(),
            ipv6_urls: Vec::new(),
        }
    }
}

impl ResolverConfig {
    fn validate(&self) -> Result<(), DyndnsError> {
        match self {
            ResolverConfig::Static { ipv4: None, ipv6: None } => Err(DyndnsError::Config(
                "static resolver needs ipv4 or ipv6".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Delivery channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DispatcherConfig {
    /// JSON POST to a webhook.
    Http {
        /// Webhook URL.
        url: String,
    },
}

impl DispatcherConfig {
    fn validate(&self, name: &str) -> Result<(), DyndnsError> {
        match self {
            DispatcherConfig::Http { url } if url.is_empty() => Err(DyndnsError::Config(
                format!("dispatcher {} has an empty url", name),
            )),
            DispatcherConfig::Http { .. } => Ok(()),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// host -> trusted base64 Ed25519 public keys.
    #[serde(default)]
    pub known_hosts: BTreeMap<String, Vec<String>>,

    /// Address the webhook front-end listens on.
    #[serde(default = "default_webhook_listen_addr")]
    pub webhook_listen_addr: SocketAddr,

    /// TTL for written records in seconds.
    #[serde(default = "default_ttl")]
    pub record_ttl: u32,

    /// Claims older than this are rejected, in seconds.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Capacity of the inbound claim channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Authoritative DNS front-end serving the written records.
    pub dns: DnsConfig,
}

/// Authoritative DNS front-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address the DNS server listens on (UDP and TCP).
    #[serde(default = "default_dns_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Zone served (e.g., "dyn.example.com"); every known host must be inside it.
    pub zone: String,

    /// SOA record configuration.
    #[serde(default)]
    pub soa: SoaConfig,
}

/// SOA (Start of Authority) record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Primary nameserver hostname (e.g., "ns1.example.com").
    pub mname: String,

    /// Admin email in DNS format (e.g., "admin.example.com" for admin@example.com).
    pub rname: String,

    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u32,

    /// Retry interval in seconds.
    #[serde(default = "default_soa_retry")]
    pub retry: u32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,

    /// Minimum TTL in seconds.
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            mname: "ns1.example.com".to_string(),
            rname: "admin.example.com".to_string(),
            refresh: default_refresh(),
            retry: default_soa_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

impl ServerConfig {
    /// Check bounds and required fields.
    pub fn validate(&self) -> Result<(), DyndnsError> {
        if self.known_hosts.is_empty() {
            return Err(DyndnsError::Config("no known hosts configured".into()));
        }
        if self.grace_period_secs == 0 {
            return Err(DyndnsError::Config(
                "server.grace_period_secs must be positive".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(DyndnsError::Config(
                "server.channel_capacity must be positive".into(),
            ));
        }

        let zone = Name::from_ascii(&self.dns.zone).map_err(|e| {
            DyndnsError::Config(format!("server.dns.zone {} is invalid: {}", self.dns.zone, e))
        })?;
        for host in self.known_hosts.keys() {
            let served = Name::from_ascii(host)
                .map(|name| zone.zone_of(&name))
                .unwrap_or(false);
            if !served {
                return Err(DyndnsError::Config(format!(
                    "known host {} is outside server.dns.zone {}",
                    host, self.dns.zone
                )));
            }
        }
        Ok(())
    }

    /// Staleness window.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dyndns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "dyndns".to_string()
}

fn default_resolve_interval() -> u64 {
    45
}

fn default_unconfirmed_interval() -> u64 {
    30
}

fn default_confirmed_jitter() -> u64 {
    15
}

fn default_retry_interval() -> u64 {
    60
}

fn default_dispatch_timeout() -> u64 {
    10
}

fn default_webhook_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_ttl() -> u32 {
    60
}

fn default_grace_period() -> u64 {
    86400
}

fn default_channel_capacity() -> usize {
    64
}

fn default_dns_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_refresh() -> u32 {
    3600
}

fn default_soa_retry() -> u32 {
    600
}

fn default_expire() -> u32 {
    604800
}

fn default_minimum() -> u32 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(toml: &str) -> Config {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        Config::load(file.path()).unwrap()
    }

    const CLIENT: &str = r#"
        [client]
        host = "home.example.com"
        keypair_path = "/var/lib/dyndns/keypair.json"

        [client.dispatchers.http]
        kind = "http"
        url = "https://dyndns.example.com/update"
    "#;

    #[test]
    fn test_client_defaults() {
        let config = load(CLIENT);
        let client = config.client.unwrap();

        client.validate().unwrap();
        assert_eq!(client.resolve_interval_secs, 45);
        assert_eq!(client.unconfirmed_interval_secs, 30);
        assert_eq!(client.confirmed_jitter_secs, 15);
        assert_eq!(client.retry_interval_secs, 60);
        assert!(!client.force_send_on_start);
        assert!(matches!(client.resolver, ResolverConfig::Http { .. }));
        assert_eq!(client.lookup_nameserver, None);
        assert!(config.server.is_none());
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_static_resolver_config() {
        let config = load(&format!(
            "{}\n[client.resolver]\nkind = \"static\"\nipv4 = \"203.0.113.5\"\n",
            CLIENT
        ));
        match config.client.unwrap().resolver {
            ResolverConfig::Static { ipv4, ipv6 } => {
                assert_eq!(ipv4, Some("203.0.113.5".parse().unwrap()));
                assert_eq!(ipv6, None);
            }
            other => panic!("unexpected resolver: {other:?}"),
        }
    }

    #[test]
    fn test_client_validation() {
        let mut client = load(CLIENT).client.unwrap();

        client.resolve_interval_secs = 5;
        assert!(client.validate().is_err());
        client.resolve_interval_secs = 300;
        client.validate().unwrap();

        client.dispatchers.clear();
        assert!(client.validate().is_err());
    }

    const SERVER: &str = r#"
        [server.known_hosts]
        "home.example.com" = ["key-one", "key-two"]

        [server.dns]
        zone = "example.com"
    "#;

    #[test]
    fn test_server_config() {
        let server = load(SERVER).server.unwrap();

        server.validate().unwrap();
        assert_eq!(server.known_hosts["home.example.com"].len(), 2);
        assert_eq!(server.webhook_listen_addr.port(), 8080);
        assert_eq!(server.record_ttl, 60);
        assert_eq!(server.grace_period(), Duration::from_secs(86400));
        assert_eq!(server.dns.listen_addr.port(), 53);
        assert_eq!(server.dns.soa.refresh, 3600);
    }

    #[test]
    fn test_server_requires_known_hosts() {
        let mut server = load(SERVER).server.unwrap();
        server.known_hosts.clear();
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_server_requires_dns_section() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[server.known_hosts]\n\"home.example.com\" = [\"key\"]\n")
            .unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_known_hosts_must_be_inside_zone() {
        let mut server = load(SERVER).server.unwrap();
        server.dns.zone = "dyn.example.com".into();
        let err = server.validate().unwrap_err();
        assert!(err.to_string().contains("outside server.dns.zone"));

        server.known_hosts = BTreeMap::from([(
            "HOME.Dyn.Example.com".to_string(),
            vec!["key".to_string()],
        )]);
        server.validate().unwrap();
    }
}
