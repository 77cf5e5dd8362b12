//! Address discovery: finding out which public address the client has.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::Client as HttpClient;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::DyndnsError;
use crate::record::DnsRecord;

/// Timeout for a single provider request.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(2);

/// Public-IP providers queried for the IPv4 address.
pub const DEFAULT_IPV4_PROVIDERS: &[&str] = &[
    "https://api.ipify.org",
    "https://ipv4.icanhazip.com",
    "https://checkip.amazonaws.com",
    "https://ipinfo.io/ip",
    "https://ipecho.net/plain",
];

/// Public-IP providers queried for the IPv6 address.
pub const DEFAULT_IPV6_PROVIDERS: &[&str] = &["https://api6.ipify.org", "https://ipv6.icanhazip.com"];

/// Source of the client's current address.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Discover the current address and return it as a fresh record.
    async fn resolve(&self) -> Result<DnsRecord, DyndnsError>;

    /// Host the discovered address belongs to.
    fn host(&self) -> &str;

    /// Resolver name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Resolver returning fixed addresses.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    host: String,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
}

impl StaticResolver {
    /// Create a resolver for `host`; at least one address is required.
    pub fn new(
        host: impl Into<String>,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Result<Self, DyndnsError> {
        let host = host.into();
        if host.is_empty() {
            return Err(DyndnsError::Config("empty host provided".into()));
        }
        if ipv4.is_none() && ipv6.is_none() {
            return Err(DyndnsError::Config(
                "static resolver needs at least one address".into(),
            ));
        }
        Ok(Self { host, ipv4, ipv6 })
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self) -> Result<DnsRecord, DyndnsError> {
        let mut record = DnsRecord::new(self.host.clone());
        record.ipv4 = self.ipv4;
        record.ipv6 = self.ipv6;
        Ok(record)
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn parse(self, body: &str) -> Option<IpAddr> {
        let ip: IpAddr = body.trim().parse().ok()?;
        match (self, ip) {
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_)) => Some(ip),
            _ => None,
        }
    }
}

/// Resolver asking public "what is my IP" HTTP services.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    host: String,
    client: HttpClient,
    ipv4_urls: Vec<String>,
    ipv6_urls: Vec<String>,
}

impl HttpResolver {
    /// Create a resolver using the default provider lists.
    pub fn new(host: impl Into<String>) -> Result<Self, DyndnsError> {
        Self::with_providers(
            host,
            DEFAULT_IPV4_PROVIDERS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_IPV6_PROVIDERS.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Create a resolver with explicit provider lists per family.
    ///
    /// Either list may be empty to skip that family.
    pub fn with_providers(
        host: impl Into<String>,
        ipv4_urls: Vec<String>,
        ipv6_urls: Vec<String>,
    ) -> Result<Self, DyndnsError> {
        let host = host.into();
        if host.is_empty() {
            return Err(DyndnsError::Config("empty host provided".into()));
        }
        if ipv4_urls.is_empty() && ipv6_urls.is_empty() {
            return Err(DyndnsError::Config("no resolver urls provided".into()));
        }

        let client = HttpClient::builder().timeout(PROVIDER_TIMEOUT).build()?;
        Ok(Self {
            host,
            client,
            ipv4_urls,
            ipv6_urls,
        })
    }

    async fn resolve_family(&self, family: Family, urls: &[String]) -> Option<IpAddr> {
        let mut urls: Vec<&String> = urls.iter().collect();
        urls.shuffle(&mut rand::thread_rng());

        for url in urls {
            match self.resolve_single(url).await {
                Ok(body) => match family.parse(&body) {
                    Some(ip) => {
                        debug!(url = %url, ip = %ip, "resolved address");
                        return Some(ip);
                    }
                    None => debug!(url = %url, ?family, "response is not an address of the wanted family"),
                },
                Err(e) => warn!(url = %url, error = %e, "error while resolving ip"),
            }
        }
        None
    }

    async fn resolve_single(&self, url: &str) -> Result<String, DyndnsError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl AddressResolver for HttpResolver {
    async fn resolve(&self) -> Result<DnsRecord, DyndnsError> {
        let mut record = DnsRecord::new(self.host.clone());

        if let Some(IpAddr::V4(ip)) = self.resolve_family(Family::V4, &self.ipv4_urls).await {
            record.ipv4 = Some(ip);
        }
        if let Some(IpAddr::V6(ip)) = self.resolve_family(Family::V6, &self.ipv6_urls).await {
            record.ipv6 = Some(ip);
        }

        if record.ipv4.is_none() && record.ipv6.is_none() {
            return Err(DyndnsError::Resolve(
                "no provider returned a usable address".into(),
            ));
        }
        Ok(record)
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
