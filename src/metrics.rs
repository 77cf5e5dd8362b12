//! Metrics instrumentation for dyndns.
//!
//! All metrics are prefixed with `dyndns.`

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use std::time::{Duration, Instant};

/// Register descriptions for every dyndns metric with the installed recorder.
pub fn describe() {
    describe_counter!("dyndns.client.ip_resolve.count", "Address discovery attempts");
    describe_gauge!(
        "dyndns.client.ip_resolve.last_check.timestamp",
        Unit::Seconds,
        "Unix time of the last discovery attempt"
    );
    describe_counter!("dyndns.client.state.change.count", "Convergence state transitions");
    describe_gauge!("dyndns.client.state.current", "1 for the current convergence state");
    describe_counter!("dyndns.client.dispatch.count", "Deliveries per dispatcher and outcome");
    describe_histogram!(
        "dyndns.client.dispatch.duration.seconds",
        Unit::Seconds,
        "Wall time of a full dispatch round"
    );
    describe_gauge!("dyndns.client.reconciler.pending", "Dispatchers still owing a delivery");
    describe_counter!("dyndns.notification.error.count", "Failed best-effort notifications");
    describe_counter!("dyndns.server.message.received.count", "Inbound update requests");
    describe_counter!("dyndns.server.message.rejected.count", "Rejected update requests");
    describe_counter!(
        "dyndns.server.message.skipped.count",
        "Authentic update requests that needed no DNS write"
    );
    describe_counter!("dyndns.server.propagation.count", "DNS propagation attempts");
    describe_histogram!(
        "dyndns.server.propagation.duration.seconds",
        Unit::Seconds,
        "Duration of DNS propagation"
    );
    describe_gauge!("dyndns.server.known_hosts.count", "Hosts with a usable public key");
    describe_counter!(
        "dyndns.server.public_key.error.count",
        "Configured public keys that could not be decoded"
    );
    describe_counter!("dyndns.server.dns.query.count", "DNS queries answered by the authority");
    describe_histogram!(
        "dyndns.server.dns.query.duration.seconds",
        Unit::Seconds,
        "Time to answer a DNS query"
    );
    describe_gauge!(
        "dyndns.server.heartbeat.timestamp",
        Unit::Seconds,
        "Unix time of the last server heartbeat"
    );
}

/// Outcome of an address discovery attempt.
#[derive(Debug, Clone, Copy)]
pub enum ResolveResult {
    /// A valid public address was discovered.
    Success,
    /// The resolver failed.
    Error,
    /// The resolver returned an unusable address.
    Invalid,
}

/// Record an address discovery attempt.
pub fn record_ip_resolve(host: &str, resolver: &str, result: ResolveResult) {
    let result_str = match result {
        ResolveResult::Success => "success",
        ResolveResult::Error => "error",
        ResolveResult::Invalid => "invalid",
    };

    counter!("dyndns.client.ip_resolve.count", "host" => host.to_string(), "resolver" => resolver.to_string(), "result" => result_str)
        .increment(1);
    gauge!("dyndns.client.ip_resolve.last_check.timestamp", "host" => host.to_string())
        .set(unix_now());
}

/// Record a state machine transition.
pub fn record_state_change(host: &str, from: &'static str, to: &'static str) {
    counter!("dyndns.client.state.change.count", "host" => host.to_string(), "from" => from, "to" => to)
        .increment(1);
    gauge!("dyndns.client.state.current", "host" => host.to_string(), "state" => from).set(0.0);
    gauge!("dyndns.client.state.current", "host" => host.to_string(), "state" => to).set(1.0);
}

/// Outcome of a single channel delivery.
#[derive(Debug, Clone, Copy)]
pub enum DispatchResult {
    /// Channel accepted the claim.
    Success,
    /// Channel returned an error.
    Error,
    /// Channel did not answer in time.
    Timeout,
}

/// Record a single channel delivery.
pub fn record_dispatch(dispatcher: &str, result: DispatchResult) {
    let result_str = match result {
        DispatchResult::Success => "success",
        DispatchResult::Error => "error",
        DispatchResult::Timeout => "timeout",
    };

    counter!("dyndns.client.dispatch.count", "dispatcher" => dispatcher.to_string(), "result" => result_str)
        .increment(1);
}

/// Record the wall time of a full dispatch round.
pub fn record_dispatch_round(duration: Duration) {
    histogram!("dyndns.client.dispatch.duration.seconds").record(duration.as_secs_f64());
}

/// Record how many channels still await delivery.
pub fn record_pending(host: &str, pending: usize) {
    gauge!("dyndns.client.reconciler.pending", "host" => host.to_string()).set(pending as f64);
}

/// Record a failed best-effort notification.
pub fn record_notification_error() {
    counter!("dyndns.notification.error.count").increment(1);
}

/// Record an inbound claim.
pub fn record_message_received() {
    counter!("dyndns.server.message.received.count").increment(1);
    gauge!("dyndns.server.message.last_received.timestamp").set(unix_now());
}

/// Why a claim was rejected.
#[derive(Debug, Clone, Copy)]
pub enum RejectReason {
    /// Structural validation failed.
    InvalidFields,
    /// No keys configured for the host.
    UnknownHost,
    /// No key verified the signature.
    SignatureMismatch,
    /// Timestamp outside the grace window.
    MessageTooOld,
}

/// Record a rejected claim.
pub fn record_rejected(host: &str, reason: RejectReason) {
    let reason_str = match reason {
        RejectReason::InvalidFields => "invalid_fields",
        RejectReason::UnknownHost => "unknown_host",
        RejectReason::SignatureMismatch => "signature_mismatch",
        RejectReason::MessageTooOld => "message_too_old",
    };

    counter!("dyndns.server.message.rejected.count", "host" => host.to_string(), "reason" => reason_str)
        .increment(1);
}

/// Why an authentic claim did not need a DNS write.
#[derive(Debug, Clone, Copy)]
pub enum SkipReason {
    /// Already applied, per the idempotency cache.
    Cached,
    /// Live DNS already shows the claimed address.
    AlreadyResolved,
}

/// Record an authentic claim that required no write.
pub fn record_skipped(host: &str, reason: SkipReason) {
    let reason_str = match reason {
        SkipReason::Cached => "cached",
        SkipReason::AlreadyResolved => "already_resolved",
    };

    counter!("dyndns.server.message.skipped.count", "host" => host.to_string(), "reason" => reason_str)
        .increment(1);
}

/// Record a DNS propagation attempt.
pub fn record_propagation(host: &str, success: bool, duration: Duration) {
    let result_str = if success { "success" } else { "error" };
    counter!("dyndns.server.propagation.count", "host" => host.to_string(), "result" => result_str)
        .increment(1);
    histogram!("dyndns.server.propagation.duration.seconds").record(duration.as_secs_f64());
}

/// Record the number of hosts with usable keys.
pub fn record_known_hosts(count: usize) {
    gauge!("dyndns.server.known_hosts.count").set(count as f64);
}

/// Record a configured public key that could not be decoded.
pub fn record_public_key_error() {
    counter!("dyndns.server.public_key.error.count").increment(1);
}

/// Outcome of a DNS query against the authority.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Records returned.
    Success,
    /// Host has no records.
    NxDomain,
    /// Host exists without records of the queried type.
    NoData,
}

/// Record a DNS query answered by the authority.
pub fn record_query(record_type: &str, result: QueryResult, duration: Duration) {
    let result_str = match result {
        QueryResult::Success => "success",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::NoData => "nodata",
    };

    counter!("dyndns.server.dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("dyndns.server.dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a server liveness heartbeat.
pub fn record_heartbeat() {
    gauge!("dyndns.server.heartbeat.timestamp").set(unix_now());
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp() as f64
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
