//! Verification and idempotent propagation of inbound claims.

use chrono::{TimeDelta, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tripwire::Tripwire;

use crate::error::DyndnsError;
use crate::lookup::{host_matches_record, AddressLookup};
use crate::metrics::{self, RejectReason, SkipReason, Timer};
use crate::notification::Notifier;
use crate::propagator::Propagator;
use crate::record::{DnsRecord, UpdateRecordRequest};
use crate::signature::{Keypair, VerificationKey};

/// Default staleness window for claims.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval of the liveness heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// host -> keys trusted to sign claims for it.
pub type KnownHosts = HashMap<String, Vec<Arc<dyn VerificationKey>>>;

/// Decode configured base64 public keys.
///
/// Undecodable keys are skipped, hosts without any usable key are dropped.
/// Fails if no host survives.
pub fn decode_known_hosts(
    configured: &BTreeMap<String, Vec<String>>,
) -> Result<KnownHosts, DyndnsError> {
    let mut known_hosts = KnownHosts::with_capacity(configured.len());

    for (host, encoded_keys) in configured {
        let mut keys: Vec<Arc<dyn VerificationKey>> = Vec::with_capacity(encoded_keys.len());
        for (index, encoded) in encoded_keys.iter().enumerate() {
            match Keypair::from_public_key_base64(encoded) {
                Ok(key) => keys.push(Arc::new(key)),
                Err(e) => {
                    error!(host = %host, index, error = %e, "could not decode public key");
                    metrics::record_public_key_error();
                }
            }
        }

        if keys.is_empty() {
            warn!(host = %host, "no usable public key, ignoring host");
            continue;
        }
        known_hosts.insert(host.clone(), keys);
    }

    if known_hosts.is_empty() {
        return Err(DyndnsError::Config(
            "no known hosts with a usable public key".into(),
        ));
    }
    Ok(known_hosts)
}

/// Authenticates claims and writes real changes to DNS exactly once.
pub struct DyndnsServer {
    known_hosts: KnownHosts,
    cache: RwLock<HashMap<String, DnsRecord>>,
    propagator: Arc<dyn Propagator>,
    lookup: Arc<dyn AddressLookup>,
    notifier: Arc<dyn Notifier>,
    grace_period: Duration,
}

impl DyndnsServer {
    /// Create a server; `known_hosts` must not be empty.
    pub fn new(
        known_hosts: KnownHosts,
        propagator: Arc<dyn Propagator>,
        lookup: Arc<dyn AddressLookup>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, DyndnsError> {
        if known_hosts.is_empty() {
            return Err(DyndnsError::Config("no known hosts configured".into()));
        }
        metrics::record_known_hosts(known_hosts.len());

        Ok(Self {
            known_hosts,
            cache: RwLock::new(HashMap::new()),
            propagator,
            lookup,
            notifier,
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }

    /// Override the staleness window.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Number of hosts with at least one usable key.
    pub fn known_hosts_count(&self) -> usize {
        self.known_hosts.len()
    }

    /// Last record applied for `host`.
    pub fn cached(&self, host: &str) -> Option<DnsRecord> {
        self.cache.read().get(host).cloned()
    }

    fn is_cached(&self, record: &DnsRecord) -> bool {
        self.cache
            .read()
            .get(&record.host)
            .is_some_and(|cached| cached == record)
    }

    fn verify(&self, request: &UpdateRecordRequest) -> Result<(), DyndnsError> {
        let host = &request.record.host;
        let Some(keys) = self.known_hosts.get(host) else {
            return Err(DyndnsError::UnknownHost(host.clone()));
        };

        if keys
            .iter()
            .any(|key| key.verify(&request.signature, &request.record))
        {
            return Ok(());
        }
        Err(DyndnsError::SignatureMismatch(host.clone()))
    }

    fn check_age(&self, record: &DnsRecord) -> Result<(), DyndnsError> {
        let grace = TimeDelta::from_std(self.grace_period).unwrap_or(TimeDelta::MAX);
        match Utc::now().checked_sub_signed(grace) {
            Some(cutoff) if record.observed_at < cutoff => Err(DyndnsError::MessageTooOld),
            _ => Ok(()),
        }
    }

    /// Verify a claim and propagate it if it describes a real change.
    pub async fn handle_propagate_request(
        &self,
        request: &UpdateRecordRequest,
    ) -> Result<(), DyndnsError> {
        metrics::record_message_received();
        let host = request.record.host.as_str();

        if let Err(e) = request.validate() {
            metrics::record_rejected(host, RejectReason::InvalidFields);
            return Err(e);
        }

        if let Err(e) = self.verify(request) {
            let reason = match e {
                DyndnsError::UnknownHost(_) => RejectReason::UnknownHost,
                _ => RejectReason::SignatureMismatch,
            };
            metrics::record_rejected(host, reason);
            return Err(e);
        }

        if let Err(e) = self.check_age(&request.record) {
            metrics::record_rejected(host, RejectReason::MessageTooOld);
            return Err(e);
        }

        if self.is_cached(&request.record) {
            debug!(host, "update already applied");
            metrics::record_skipped(host, SkipReason::Cached);
            return Ok(());
        }

        if host_matches_record(self.lookup.as_ref(), &request.record).await {
            debug!(host, "record already resolves to the claimed address");
            metrics::record_skipped(host, SkipReason::AlreadyResolved);
            return Ok(());
        }

        let timer = Timer::start();
        let result = self.propagator.propagate_change(&request.record).await;
        metrics::record_propagation(host, result.is_ok(), timer.elapsed());
        result?;

        info!(
            host,
            ipv4 = ?request.record.ipv4,
            ipv6 = ?request.record.ipv6,
            "propagated dns change"
        );

        if let Err(e) = self.notifier.notify_updated_ip_applied(&request.record).await {
            warn!(host, error = %e, "could not send notification");
            metrics::record_notification_error();
        }

        self.cache
            .write()
            .insert(request.record.host.clone(), request.record.clone());
        Ok(())
    }

    /// Drain the inbound channel until it closes or the tripwire fires.
    ///
    /// Claims are handled one at a time; failures never stop the loop. On
    /// shutdown the channel is closed and claims already queued are still
    /// handled.
    pub async fn listen(&self, mut rx: mpsc::Receiver<UpdateRecordRequest>, mut tripwire: Tripwire) {
        info!(known_hosts = self.known_hosts.len(), "listening for update requests");

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(request) = message else {
                        info!("inbound channel closed");
                        return;
                    };
                    self.handle_logged(&request).await;
                }
                _ = &mut tripwire => {
                    info!("listener shutting down");
                    break;
                }
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(request) = rx.recv().await {
            self.handle_logged(&request).await;
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "handled queued update requests");
        }
    }

    async fn handle_logged(&self, request: &UpdateRecordRequest) {
        match self.handle_propagate_request(request).await {
            Ok(()) => {}
            Err(e) if e.is_too_old() => {
                debug!(host = %request.record.host, "ignoring stale update request");
            }
            Err(e) => {
                error!(host = %request.record.host, error = %e, "could not handle update request");
            }
        }
    }

    /// Run the listener and the heartbeat until the tripwire fires.
    pub async fn run(self: Arc<Self>, rx: mpsc::Receiver<UpdateRecordRequest>, tripwire: Tripwire) {
        let heartbeat_tripwire = tripwire.clone();
        let heartbeat_handle = tokio::spawn(heartbeat_loop(heartbeat_tripwire));

        self.listen(rx, tripwire).await;

        let _ = heartbeat_handle.await;
        info!("server stopped");
    }
}

async fn heartbeat_loop(mut tripwire: Tripwire) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                metrics::record_heartbeat();
            }
            _ = &mut tripwire => {
                debug!("heartbeat loop shutting down");
                return;
            }
        }
    }
}
