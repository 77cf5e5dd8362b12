//! Live DNS lookups used to decide whether the authoritative record has converged.

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::TokioResolver;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::error::DyndnsError;
use crate::record::DnsRecord;

/// Resolve a host to its currently published addresses.
#[async_trait]
pub trait AddressLookup: Send + Sync {
    /// Look up all A/AAAA addresses for `host`.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DyndnsError>;
}

/// True if any published address equals one of the record's addresses.
pub fn record_matches(ips: &[IpAddr], record: &DnsRecord) -> bool {
    ips.iter().any(|ip| record.contains(ip))
}

/// Look up `record.host` and report whether DNS already shows its address.
///
/// Lookup failures count as "not matching".
pub async fn host_matches_record(lookup: &dyn AddressLookup, record: &DnsRecord) -> bool {
    match lookup.lookup(&record.host).await {
        Ok(ips) => record_matches(&ips, record),
        Err(e) => {
            debug!(host = %record.host, error = %e, "lookup failed");
            false
        }
    }
}

/// Lookup through the system resolver configuration.
pub struct SystemLookup {
    resolver: TokioResolver,
}

impl SystemLookup {
    /// Build a lookup from `/etc/resolv.conf` (or platform equivalent).
    pub fn new() -> Result<Self, DyndnsError> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| DyndnsError::Config(format!("failed to create resolver: {}", e)))?
            .build();
        Ok(Self { resolver })
    }

    /// Query one name server directly (typically the zone's authority), uncached.
    pub fn with_nameserver(addr: SocketAddr) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        config.add_name_server(NameServerConfig::new(addr, Protocol::Tcp));

        let mut options = ResolverOpts::default();
        options.cache_size = 0;

        let resolver = TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(options)
            .build();
        Self { resolver }
    }
}

#[async_trait]
impl AddressLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DyndnsError> {
        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| DyndnsError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(response.iter().collect())
    }
}
