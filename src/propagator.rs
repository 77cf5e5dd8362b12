//! DNS propagation: turning an accepted claim into A/AAAA upserts.

use async_trait::async_trait;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

use crate::error::DyndnsError;
use crate::lookup::AddressLookup;
use crate::record::DnsRecord;

/// TTL for records written on behalf of clients.
pub const DEFAULT_RECORD_TTL: u32 = 60;

/// Writes a host's address records to the authoritative DNS provider.
#[async_trait]
pub trait Propagator: Send + Sync {
    /// Upsert A (ipv4) and AAAA (ipv6) records for `record.host`.
    async fn propagate_change(&self, record: &DnsRecord) -> Result<(), DyndnsError>;
}

/// Build the upsert set for a record: one A and/or one AAAA record.
pub fn record_changes(record: &DnsRecord, ttl: u32) -> Result<Vec<Record>, DyndnsError> {
    let name = Name::from_ascii(&record.host).map_err(|e| DyndnsError::Propagation {
        host: record.host.clone(),
        reason: format!("invalid host name: {}", e),
    })?;

    let mut changes = Vec::with_capacity(2);
    if let Some(ipv4) = record.ipv4 {
        changes.push(build_record(name.clone(), ttl, RData::A(A::from(ipv4))));
    }
    if let Some(ipv6) = record.ipv6 {
        changes.push(build_record(name, ttl, RData::AAAA(AAAA::from(ipv6))));
    }

    if changes.is_empty() {
        return Err(DyndnsError::Propagation {
            host: record.host.clone(),
            reason: "empty list of changes".into(),
        });
    }
    Ok(changes)
}

fn build_record(name: Name, ttl: u32, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Thread-safe in-memory authoritative zone.
///
/// Applies propagated changes and answers lookups from the applied records,
/// so a client and server can converge without an external provider.
#[derive(Debug, Clone)]
pub struct MemoryZone {
    inner: Arc<RwLock<MemoryZoneInner>>,
}

#[derive(Debug)]
struct MemoryZoneInner {
    /// TTL for upserted records.
    ttl: u32,

    /// host -> records (at most one A and one AAAA)
    records: HashMap<String, Vec<Record>>,

    /// Incremented on every applied change.
    serial: u32,
}

impl Default for MemoryZone {
    fn default() -> Self {
        Self::new(DEFAULT_RECORD_TTL)
    }
}

impl MemoryZone {
    /// Create an empty zone writing records with the given TTL.
    pub fn new(ttl: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryZoneInner {
                ttl,
                records: HashMap::new(),
                serial: 0,
            })),
        }
    }

    /// Apply an upsert for `record`, replacing same-type records of the host.
    pub fn upsert(&self, record: &DnsRecord) -> Result<(), DyndnsError> {
        let mut inner = self.inner.write();
        let changes = record_changes(record, inner.ttl)?;
        let entry = inner.records.entry(normalize_host(&record.host)).or_default();

        for change in changes {
            entry.retain(|existing| existing.record_type() != change.record_type());
            entry.push(change);
        }

        debug!(host = %record.host, records = entry.len(), "upserted records");
        inner.serial = inner.serial.wrapping_add(1);
        Ok(())
    }

    /// Remove all records of a host (out-of-band change).
    pub fn remove_host(&self, host: &str) {
        let mut inner = self.inner.write();
        if inner.records.remove(&normalize_host(host)).is_some() {
            debug!(host, "removed host");
            inner.serial = inner.serial.wrapping_add(1);
        }
    }

    /// Published addresses for a host, empty if unknown.
    pub fn addresses(&self, host: &str) -> Vec<IpAddr> {
        let inner = self.inner.read();
        inner
            .records
            .get(&normalize_host(host))
            .map(|records| records.iter().filter_map(record_address).collect())
            .unwrap_or_default()
    }

    /// Raw records published for a host.
    pub fn records(&self, host: &str) -> Vec<Record> {
        self.inner
            .read()
            .records
            .get(&normalize_host(host))
            .cloned()
            .unwrap_or_default()
    }

    /// Current zone serial.
    pub fn serial(&self) -> u32 {
        self.inner.read().serial
    }

    /// Number of hosts with records.
    pub fn hosts_count(&self) -> usize {
        self.inner.read().records.len()
    }
}

fn record_address(record: &Record) -> Option<IpAddr> {
    match record.data() {
        RData::A(a) => Some(IpAddr::V4(Ipv4Addr::from(*a))),
        RData::AAAA(aaaa) => Some(IpAddr::V6(Ipv6Addr::from(*aaaa))),
        _ => None,
    }
}

#[async_trait]
impl Propagator for MemoryZone {
    async fn propagate_change(&self, record: &DnsRecord) -> Result<(), DyndnsError> {
        self.upsert(record)
    }
}

#[async_trait]
impl AddressLookup for MemoryZone {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DyndnsError> {
        let ips = self.addresses(host);
        if ips.is_empty() {
            return Err(DyndnsError::Lookup {
                host: host.to_string(),
                reason: "no records found".into(),
            });
        }
        Ok(ips)
    }
}
