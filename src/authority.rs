//! Authoritative DNS front-end answering from the in-memory zone.
//!
//! Records written by the server through [`MemoryZone`] become visible to
//! any resolver querying this authority: A and AAAA per host, plus SOA and
//! NS at the zone apex. Dynamic updates and DNSSEC are not supported.

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{NS, SOA};
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordSet, RecordType};
use hickory_server::authority::{
    Authority, AuthorityObject, Catalog, LookupControlFlow, LookupError, LookupOptions,
    LookupRecords, MessageRequest, UpdateResult, ZoneType,
};
use hickory_server::server::RequestInfo;
use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, trace};
use tripwire::Tripwire;

use crate::config::DnsConfig;
use crate::error::DyndnsError;
use crate::metrics::{self, QueryResult, Timer};
use crate::propagator::MemoryZone;

/// Idle timeout for DNS-over-TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Authority for one zone, backed by a [`MemoryZone`].
pub struct ZoneAuthority {
    origin: LowerName,
    zone: MemoryZone,
    ttl: u32,
    config: Arc<DnsConfig>,
}

impl ZoneAuthority {
    /// Create the authority for `config.zone`; apex records use `ttl`.
    pub fn new(config: DnsConfig, zone: MemoryZone, ttl: u32) -> Result<Self, DyndnsError> {
        let origin = Name::from_ascii(&config.zone)
            .map_err(|e| DyndnsError::Config(format!("invalid dns zone {}: {}", config.zone, e)))?
            .into();

        Ok(Self {
            origin,
            zone,
            ttl,
            config: Arc::new(config),
        })
    }

    fn apex_record_set(&self, rtype: RecordType, rdata: RData) -> RecordSet {
        let name = Name::from(self.origin.clone());
        let mut record_set = RecordSet::new(name.clone(), rtype, 0);
        let mut record = Record::from_rdata(name, self.ttl, rdata);
        record.set_dns_class(DNSClass::IN);
        record_set.insert(record, 0);
        record_set
    }

    /// SOA carrying the zone serial, bumped on every applied change.
    fn build_soa_record(&self) -> RecordSet {
        let soa = SOA::new(
            Name::from_ascii(&self.config.soa.mname).unwrap_or_else(|_| Name::root()),
            Name::from_ascii(&self.config.soa.rname).unwrap_or_else(|_| Name::root()),
            self.zone.serial(),
            self.config.soa.refresh as i32,
            self.config.soa.retry as i32,
            self.config.soa.expire as i32,
            self.config.soa.minimum,
        );
        self.apex_record_set(RecordType::SOA, RData::SOA(soa))
    }

    fn build_ns_record(&self) -> RecordSet {
        let ns_name = Name::from_ascii(&self.config.soa.mname).unwrap_or_else(|_| Name::root());
        self.apex_record_set(RecordType::NS, RData::NS(NS(ns_name)))
    }

    /// Host records of one type, renamed to the queried name.
    fn build_host_records(&self, name: Name, rtype: RecordType, records: &[Record]) -> RecordSet {
        let mut record_set = RecordSet::new(name.clone(), rtype, 0);
        for published in records.iter().filter(|r| r.record_type() == rtype) {
            let mut record =
                Record::from_rdata(name.clone(), published.ttl(), published.data().clone());
            record.set_dns_class(DNSClass::IN);
            record_set.insert(record, 0);
        }
        record_set
    }
}

#[async_trait]
impl Authority for ZoneAuthority {
    type Lookup = LookupRecords;

    fn zone_type(&self) -> ZoneType {
        ZoneType::Primary
    }

    fn is_axfr_allowed(&self) -> bool {
        false
    }

    fn origin(&self) -> &LowerName {
        &self.origin
    }

    async fn lookup(
        &self,
        name: &LowerName,
        rtype: RecordType,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        let timer = Timer::start();
        let rtype_str = format!("{:?}", rtype);
        let name_str = name.to_string();
        let lookup_name = name_str.trim_end_matches('.');

        trace!(name = %lookup_name, rtype = ?rtype, "DNS lookup");

        match rtype {
            RecordType::SOA | RecordType::NS if *name == self.origin => {
                debug!(name = %lookup_name, rtype = ?rtype, "apex lookup");
                metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                let record_set = if rtype == RecordType::SOA {
                    self.build_soa_record()
                } else {
                    self.build_ns_record()
                };
                let record_set = Arc::new(record_set);
                LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
            }
            RecordType::A | RecordType::AAAA => {
                let published = self.zone.records(lookup_name);
                if published.is_empty() {
                    debug!(name = %lookup_name, rtype = ?rtype, "no records found");
                    metrics::record_query(&rtype_str, QueryResult::NxDomain, timer.elapsed());
                    return LookupControlFlow::Break(Err(LookupError::ResponseCode(
                        ResponseCode::NXDomain,
                    )));
                }

                let dns_name = Name::from(name.clone());
                let record_set = self.build_host_records(dns_name, rtype, &published);
                if record_set.is_empty() {
                    debug!(name = %lookup_name, rtype = ?rtype, "host has no records of this type");
                    metrics::record_query(&rtype_str, QueryResult::NoData, timer.elapsed());
                    return LookupControlFlow::Break(Err(LookupError::ResponseCode(
                        ResponseCode::NoError,
                    )));
                }

                debug!(name = %lookup_name, count = record_set.len(), "returning records");
                metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                let record_set = Arc::new(record_set);
                LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
            }
            _ => {
                trace!(name = %lookup_name, rtype = ?rtype, "Unsupported record type");
                metrics::record_query(&rtype_str, QueryResult::NoData, timer.elapsed());
                LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
            }
        }
    }

    async fn search(
        &self,
        request_info: RequestInfo<'_>,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        self.lookup(
            request_info.query.name(),
            request_info.query.query_type(),
            lookup_options,
        )
        .await
    }

    async fn get_nsec_records(
        &self,
        _name: &LowerName,
        _lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
    }

    async fn update(&self, _update: &MessageRequest) -> UpdateResult<bool> {
        // Records only change through signed update requests.
        Err(ResponseCode::NotImp)
    }
}

/// Serve `authority` on the given sockets until the tripwire fires.
pub async fn serve(
    authority: ZoneAuthority,
    udp_socket: UdpSocket,
    tcp_listener: TcpListener,
    tripwire: Tripwire,
) -> Result<(), DyndnsError> {
    let origin = authority.origin().clone();

    let mut catalog = Catalog::new();
    let authority: Arc<dyn AuthorityObject> = Arc::new(authority);
    catalog.upsert(origin.clone(), vec![authority]);

    let mut server = ServerFuture::new(catalog);

    info!(addr = %udp_socket.local_addr()?, "DNS UDP listening");
    server.register_socket(udp_socket);

    info!(addr = %tcp_listener.local_addr()?, "DNS TCP listening");
    server.register_listener(tcp_listener, TCP_TIMEOUT);

    info!(zone = %origin, "DNS server ready to serve queries");

    tokio::select! {
        _ = tripwire => {
            info!("DNS server shutdown requested");
        }
        result = server.block_until_done() => {
            if let Err(e) = result {
                error!("DNS server error: {}", e);
            }
        }
    }

    info!("DNS server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoaConfig;
    use crate::record::DnsRecord;

    fn dns_config() -> DnsConfig {
        DnsConfig {
            listen_addr: "127.0.0.1:5353".parse().unwrap(),
            zone: "dyn.example.com".to_string(),
            soa: SoaConfig::default(),
        }
    }

    fn authority(zone: &MemoryZone) -> ZoneAuthority {
        ZoneAuthority::new(dns_config(), zone.clone(), 60).unwrap()
    }

    fn home() -> DnsRecord {
        DnsRecord::new("home.dyn.example.com").with_ipv4("203.0.113.5".parse().unwrap())
    }

    fn name(s: &str) -> LowerName {
        Name::from_ascii(s).unwrap().into()
    }

    #[tokio::test]
    async fn test_lookup_a_returns_published_address() {
        let zone = MemoryZone::default();
        zone.upsert(&home()).unwrap();

        let result = authority(&zone)
            .lookup(&name("home.dyn.example.com."), RecordType::A, LookupOptions::default())
            .await;

        assert!(matches!(result, LookupControlFlow::Break(Ok(_))));
    }

    #[tokio::test]
    async fn test_lookup_unknown_host_is_nxdomain() {
        let zone = MemoryZone::default();

        let result = authority(&zone)
            .lookup(&name("missing.dyn.example.com."), RecordType::A, LookupOptions::default())
            .await;

        assert!(matches!(
            result,
            LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NXDomain)))
        ));
    }

    #[tokio::test]
    async fn test_lookup_missing_family_is_nodata() {
        let zone = MemoryZone::default();
        zone.upsert(&home()).unwrap();

        let result = authority(&zone)
            .lookup(&name("home.dyn.example.com."), RecordType::AAAA, LookupOptions::default())
            .await;

        assert!(matches!(
            result,
            LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
        ));
    }

    #[tokio::test]
    async fn test_lookup_soa_at_apex() {
        let zone = MemoryZone::default();
        let result = authority(&zone)
            .lookup(&name("dyn.example.com."), RecordType::SOA, LookupOptions::default())
            .await;

        assert!(matches!(result, LookupControlFlow::Break(Ok(_))));
    }

    #[test]
    fn test_soa_serial_follows_zone() {
        let zone = MemoryZone::default();
        let authority = authority(&zone);
        zone.upsert(&home()).unwrap();

        let soa = authority.build_soa_record();
        let serial = soa
            .records_without_rrsigs()
            .find_map(|r| match r.data() {
                RData::SOA(soa) => Some(soa.serial()),
                _ => None,
            })
            .unwrap();
        assert_eq!(serial, 1);
    }

    #[test]
    fn test_invalid_zone_rejected() {
        let config = DnsConfig {
            zone: format!("{}.example.com", "a".repeat(64)),
            ..dns_config()
        };
        assert!(ZoneAuthority::new(config, MemoryZone::default(), 60).is_err());
    }
}
