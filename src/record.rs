//! Discovered address snapshots and the signed claims that carry them.
//!
//! The canonical digest returned by [`DnsRecord::hash`] is the exact byte
//! sequence that gets signed. Verifiers rebuild it from the record fields;
//! they never re-serialize the JSON. Addresses keep the text they arrived
//! with, so a signer emitting `2001:DB8:0:0::1` is verified against that
//! text and not against `2001:db8::1`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::DyndnsError;

/// A host's addresses as observed at one point in time.
///
/// Equality ignores `observed_at`: two records with the same host and
/// addresses describe the same logical state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "WireRecord", into = "WireRecord")]
pub struct DnsRecord {
    /// Fully qualified host name the record belongs to.
    pub host: String,
    /// Public IPv4 address, if discovered.
    pub ipv4: Option<Ipv4Addr>,
    /// Public IPv6 address, if discovered.
    pub ipv6: Option<Ipv6Addr>,
    /// When the addresses were observed.
    pub observed_at: DateTime<Utc>,
    received: ReceivedText,
}

/// Address text exactly as it was decoded.
#[derive(Debug, Clone, Default)]
struct ReceivedText {
    ipv4: Option<String>,
    ipv6: Option<String>,
}

/// JSON shape of a record.
#[derive(Serialize, Deserialize)]
struct WireRecord {
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ipv6: Option<String>,
    timestamp: DateTime<Utc>,
}

impl TryFrom<WireRecord> for DnsRecord {
    type Error = std::net::AddrParseError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            host: wire.host,
            ipv4: wire.ipv4.as_deref().map(str::parse).transpose()?,
            ipv6: wire.ipv6.as_deref().map(str::parse).transpose()?,
            observed_at: wire.timestamp,
            received: ReceivedText {
                ipv4: wire.ipv4,
                ipv6: wire.ipv6,
            },
        })
    }
}

impl From<DnsRecord> for WireRecord {
    fn from(record: DnsRecord) -> Self {
        Self {
            ipv4: record.ipv4_text(),
            ipv6: record.ipv6_text(),
            host: record.host,
            timestamp: record.observed_at,
        }
    }
}

/// The received text while it still denotes `addr`, else the standard form.
fn address_text<A>(addr: Option<A>, received: Option<&str>) -> Option<String>
where
    A: fmt::Display + std::str::FromStr + PartialEq,
{
    let addr = addr?;
    match received {
        Some(text) if text.parse::<A>().ok().as_ref() == Some(&addr) => Some(text.to_string()),
        _ => Some(addr.to_string()),
    }
}

impl DnsRecord {
    /// Create an address-less record for `host`, observed now.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ipv4: None,
            ipv6: None,
            observed_at: Utc::now(),
            received: ReceivedText::default(),
        }
    }

    /// Set the IPv4 address.
    pub fn with_ipv4(mut self, ipv4: Ipv4Addr) -> Self {
        self.ipv4 = Some(ipv4);
        self
    }

    /// Set the IPv6 address.
    pub fn with_ipv6(mut self, ipv6: Ipv6Addr) -> Self {
        self.ipv6 = Some(ipv6);
        self
    }

    /// Override the observation time.
    pub fn with_observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Whether `ip` is one of this record's addresses.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.ipv4.as_ref() == Some(v4),
            IpAddr::V6(v6) => self.ipv6.as_ref() == Some(v6),
        }
    }

    /// IPv4 address text as signed: the decoded text if it still matches.
    pub fn ipv4_text(&self) -> Option<String> {
        address_text(self.ipv4, self.received.ipv4.as_deref())
    }

    /// IPv6 address text as signed: the decoded text if it still matches.
    pub fn ipv6_text(&self) -> Option<String> {
        address_text(self.ipv6, self.received.ipv6.as_deref())
    }

    /// Canonical digest over `(observed_at, host, ipv4, ipv6)`.
    ///
    /// Lowercase hex SHA-256 of `"{unix_seconds}{host}{ipv4}{ipv6}"`, absent
    /// addresses contributing nothing.
    pub fn hash(&self) -> String {
        let ipv4 = self.ipv4_text().unwrap_or_default();
        let ipv6 = self.ipv6_text().unwrap_or_default();
        let value = format!(
            "{}{}{}{}",
            self.observed_at.timestamp(),
            self.host,
            ipv4,
            ipv6
        );
        format!("{:x}", Sha256::digest(value.as_bytes()))
    }

    /// Structural validation: host set, at least one address, real timestamp.
    pub fn validate(&self) -> Result<(), DyndnsError> {
        if self.host.is_empty() {
            return Err(DyndnsError::InvalidRequest("domain is missing".into()));
        }
        if self.ipv4.is_none() && self.ipv6.is_none() {
            return Err(DyndnsError::InvalidRequest(
                "both ipv4 and ipv6 are empty".into(),
            ));
        }
        if self.observed_at.timestamp() <= 0 {
            return Err(DyndnsError::InvalidRequest("timestamp empty".into()));
        }
        Ok(())
    }

    /// Whether this is a usable discovered public address.
    ///
    /// Private, loopback and link-local IPv4 ranges are rejected, as are
    /// loopback and unique-local IPv6 addresses.
    pub fn is_valid(&self) -> bool {
        if self.validate().is_err() {
            return false;
        }
        let v4_ok = self.ipv4.map_or(true, |ip| is_public_ipv4(&ip));
        let v6_ok = self.ipv6.map_or(true, |ip| is_public_ipv6(&ip));
        v4_ok && v6_ok
    }
}

fn is_public_ipv4(ip: &Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}

fn is_public_ipv6(ip: &Ipv6Addr) -> bool {
    // fc00::/7
    let unique_local = (ip.segments()[0] & 0xfe00) == 0xfc00;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local)
}

impl PartialEq for DnsRecord {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.ipv4 == other.ipv4 && self.ipv6 == other.ipv6
    }
}

impl Eq for DnsRecord {}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ipv4, self.ipv6) {
            (Some(v4), Some(v6)) => write!(f, "{}: {} (v4), {} (v6)", self.host, v4, v6),
            (Some(v4), None) => write!(f, "{}: {} (v4)", self.host, v4),
            (None, Some(v6)) => write!(f, "{}: {} (v6)", self.host, v6),
            (None, None) => write!(f, "{}: <no address>", self.host),
        }
    }
}

/// A signed claim that a host's address is the given value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecordRequest {
    /// The claimed record.
    #[serde(rename = "public_ip")]
    pub record: DnsRecord,
    /// Base64 signature over [`DnsRecord::hash`].
    pub signature: String,
}

impl UpdateRecordRequest {
    /// Bundle a record with its signature.
    pub fn new(record: DnsRecord, signature: String) -> Self {
        Self { record, signature }
    }

    /// Require a signature and a structurally valid record.
    pub fn validate(&self) -> Result<(), DyndnsError> {
        if self.signature.is_empty() {
            return Err(DyndnsError::InvalidRequest("signature is missing".into()));
        }
        self.record.validate()
    }
}
