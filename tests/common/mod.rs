//! Shared test infrastructure for client/server integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dyndns::server::{decode_known_hosts, KnownHosts};
use dyndns::{
    AddressLookup, AddressResolver, Dispatcher, DnsRecord, DyndnsError, DyndnsServer, Keypair,
    NoopNotifier, Propagator, SignatureKeypair, UpdateRecordRequest,
};

// --- Constants ---

pub const HOST: &str = "home.example.com";
pub const IPV4: &str = "203.0.113.5";
pub const OTHER_IPV4: &str = "198.51.100.7";

// --- Record helpers ---

pub fn record(ipv4: &str) -> DnsRecord {
    DnsRecord::new(HOST).with_ipv4(ipv4.parse().unwrap())
}

pub fn record_at(ipv4: &str, observed_at: DateTime<Utc>) -> DnsRecord {
    record(ipv4).with_observed_at(observed_at)
}

pub fn signed(keypair: &Keypair, record: DnsRecord) -> UpdateRecordRequest {
    let signature = keypair.sign(&record).unwrap();
    UpdateRecordRequest::new(record, signature)
}

/// Known hosts trusting the given keys for [`HOST`], in order.
pub fn known_hosts(keys: &[&Keypair]) -> KnownHosts {
    let configured = BTreeMap::from([(
        HOST.to_string(),
        keys.iter().map(|k| k.public_key_base64()).collect(),
    )]);
    decode_known_hosts(&configured).unwrap()
}

// --- ScriptedLookup ---

/// Live DNS stand-in with a switchable answer; `None` fails the lookup.
#[derive(Default)]
pub struct ScriptedLookup {
    answer: Mutex<Option<Vec<IpAddr>>>,
    calls: AtomicUsize,
}

impl ScriptedLookup {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answering(ips: &[&str]) -> Arc<Self> {
        let lookup = Self::default();
        lookup.set(ips);
        Arc::new(lookup)
    }

    pub fn set(&self, ips: &[&str]) {
        *self.answer.lock().unwrap() = Some(ips.iter().map(|ip| ip.parse().unwrap()).collect());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressLookup for ScriptedLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DyndnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DyndnsError::Lookup {
                host: host.to_string(),
                reason: "NXDOMAIN".into(),
            })
    }
}

// --- RecordingPropagator ---

/// Propagator remembering every record it was asked to write.
#[derive(Default)]
pub struct RecordingPropagator {
    changes: Mutex<Vec<DnsRecord>>,
    fail: AtomicBool,
}

impl RecordingPropagator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn changes(&self) -> Vec<DnsRecord> {
        self.changes.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.changes.lock().unwrap().len()
    }
}

#[async_trait]
impl Propagator for RecordingPropagator {
    async fn propagate_change(&self, record: &DnsRecord) -> Result<(), DyndnsError> {
        self.changes.lock().unwrap().push(record.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(DyndnsError::Propagation {
                host: record.host.clone(),
                reason: "provider throttled".into(),
            });
        }
        Ok(())
    }
}

// --- ScriptedDispatcher ---

/// Dispatcher that records deliveries and fails while told to.
#[derive(Default)]
pub struct ScriptedDispatcher {
    delivered: Mutex<Vec<UpdateRecordRequest>>,
    fail: AtomicBool,
    attempts: AtomicUsize,
}

impl ScriptedDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let dispatcher = Self::default();
        dispatcher.set_failing(true);
        Arc::new(dispatcher)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<UpdateRecordRequest> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn notify(&self, request: &UpdateRecordRequest) -> Result<(), DyndnsError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DyndnsError::Io(std::io::Error::other("broker unreachable")));
        }
        self.delivered.lock().unwrap().push(request.clone());
        Ok(())
    }
}

// --- ScriptedResolver ---

/// Address discovery returning whatever IPv4 address it was last given.
pub struct ScriptedResolver {
    ipv4: Mutex<String>,
}

impl ScriptedResolver {
    pub fn new(ipv4: &str) -> Arc<Self> {
        Arc::new(Self {
            ipv4: Mutex::new(ipv4.to_string()),
        })
    }

    pub fn set(&self, ipv4: &str) {
        *self.ipv4.lock().unwrap() = ipv4.to_string();
    }
}

#[async_trait]
impl AddressResolver for ScriptedResolver {
    async fn resolve(&self) -> Result<DnsRecord, DyndnsError> {
        let ipv4 = self.ipv4.lock().unwrap().clone();
        Ok(record(&ipv4))
    }

    fn host(&self) -> &str {
        HOST
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// --- Server builder ---

pub fn build_server(
    keys: &[&Keypair],
    propagator: Arc<RecordingPropagator>,
    lookup: Arc<ScriptedLookup>,
) -> DyndnsServer {
    DyndnsServer::new(known_hosts(keys), propagator, lookup, Arc::new(NoopNotifier)).unwrap()
}
