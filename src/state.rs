//! Client-side convergence state machine.
//!
//! On every discovery tick the machine decides whether the freshly
//! discovered record has to be (re)sent, and how long to wait before the
//! next tick:
//!
//! ```text
//!  Initial ──▶ Unconfirmed ◀──────────────┐
//!                  │ DNS shows address     │ address changed /
//!                  ▼                       │ DNS reverted
//!              Confirmed ──────────────────┘
//! ```

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::lookup::{record_matches, AddressLookup};
use crate::metrics;
use crate::notification::Notifier;
use crate::record::DnsRecord;

/// Base interval between discovery ticks.
pub const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_secs(45);

/// Interval between ticks while waiting for DNS to converge.
pub const DEFAULT_UNCONFIRMED_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum jitter applied to the confirmed-state interval.
pub const DEFAULT_CONFIRMED_JITTER: Duration = Duration::from_secs(15);

/// While unconfirmed, every n-th check resends the update.
pub const RESEND_EVERY_CHECKS: u64 = 10;

/// The single live state of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceState {
    /// Nothing evaluated yet.
    Initial,
    /// An update was (or should be) sent, DNS does not show it yet.
    Unconfirmed {
        /// Evaluations that found DNS not matching.
        checks: u64,
        /// Fixed wait between ticks in this state.
        wait_interval: Duration,
    },
    /// DNS shows the last known address.
    Confirmed {
        /// Record DNS was last verified against.
        last_known: DnsRecord,
    },
}

impl ConvergenceState {
    /// Short state name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ConvergenceState::Initial => "initial",
            ConvergenceState::Unconfirmed { .. } => "unconfirmed",
            ConvergenceState::Confirmed { .. } => "confirmed",
        }
    }
}

/// Tunables of the state machine.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Base resolve interval (initial and confirmed states).
    pub resolve_interval: Duration,
    /// Wait interval while unconfirmed.
    pub unconfirmed_interval: Duration,
    /// Bound of the random jitter added to the confirmed interval.
    pub confirmed_jitter: Duration,
    /// Send on the very first evaluation without consulting DNS.
    pub force_send_on_start: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            resolve_interval: DEFAULT_RESOLVE_INTERVAL,
            unconfirmed_interval: DEFAULT_UNCONFIRMED_INTERVAL,
            confirmed_jitter: DEFAULT_CONFIRMED_JITTER,
            force_send_on_start: false,
        }
    }
}

/// Owner of the current convergence state for one host.
#[derive(Debug)]
pub struct StateMachine {
    host: String,
    config: StateMachineConfig,
    state: ConvergenceState,
    last_state_change: Instant,
}

impl StateMachine {
    /// Create a machine in the `Initial` state.
    pub fn new(host: impl Into<String>, config: StateMachineConfig) -> Self {
        Self {
            host: host.into(),
            config,
            state: ConvergenceState::Initial,
            last_state_change: Instant::now(),
        }
    }

    /// The current state.
    pub fn state(&self) -> &ConvergenceState {
        &self.state
    }

    /// When the last transition happened.
    pub fn last_state_change(&self) -> Instant {
        self.last_state_change
    }

    /// Replace the current state.
    pub fn set_state(&mut self, state: ConvergenceState) {
        let from = self.state.name();
        let to = state.name();
        info!(
            host = %self.host,
            old_state = from,
            new_state = to,
            after = ?self.last_state_change.elapsed(),
            "state changed"
        );
        metrics::record_state_change(&self.host, from, to);

        self.state = state;
        self.last_state_change = Instant::now();
    }

    fn fresh_unconfirmed(&self) -> ConvergenceState {
        ConvergenceState::Unconfirmed {
            checks: 0,
            wait_interval: self.config.unconfirmed_interval,
        }
    }

    /// Evaluate a freshly discovered record; true means "send an update now".
    pub async fn evaluate(
        &mut self,
        record: &DnsRecord,
        lookup: &dyn AddressLookup,
        notifier: &dyn Notifier,
    ) -> bool {
        match self.state {
            ConvergenceState::Initial => {
                self.set_state(self.fresh_unconfirmed());
                if self.config.force_send_on_start {
                    info!(host = %record.host, "force send on start is set, sending update");
                    return true;
                }
                self.evaluate_unconfirmed(record, lookup).await
            }
            ConvergenceState::Unconfirmed { .. } => self.evaluate_unconfirmed(record, lookup).await,
            ConvergenceState::Confirmed { .. } => {
                self.evaluate_confirmed(record, lookup, notifier).await
            }
        }
    }

    async fn evaluate_unconfirmed(&mut self, record: &DnsRecord, lookup: &dyn AddressLookup) -> bool {
        let ips = match lookup.lookup(&record.host).await {
            Ok(ips) => ips,
            Err(e) => {
                warn!(host = %record.host, error = %e, "error looking up dns record");
                return true;
            }
        };

        if record_matches(&ips, record) {
            info!(host = %record.host, "DNS record verified");
            self.set_state(ConvergenceState::Confirmed {
                last_known: record.clone(),
            });
            return false;
        }

        let checks = match &mut self.state {
            ConvergenceState::Unconfirmed { checks, .. } => {
                *checks += 1;
                *checks
            }
            _ => return false,
        };

        debug!(
            host = %record.host,
            ipv4 = ?record.ipv4,
            ipv6 = ?record.ipv6,
            checks,
            "DNS entry differs from discovered address"
        );

        if checks % RESEND_EVERY_CHECKS == 0 {
            info!(
                host = %record.host,
                since = ?self.last_state_change.elapsed(),
                checks,
                "re-sending update request, propagation has not happened yet"
            );
            return true;
        }

        false
    }

    async fn evaluate_confirmed(
        &mut self,
        record: &DnsRecord,
        lookup: &dyn AddressLookup,
        notifier: &dyn Notifier,
    ) -> bool {
        let changed = match &self.state {
            ConvergenceState::Confirmed { last_known } => last_known != record,
            _ => false,
        };

        if changed {
            info!(
                host = %record.host,
                ipv4 = ?record.ipv4,
                ipv6 = ?record.ipv6,
                "new IP detected"
            );
            self.set_state(self.fresh_unconfirmed());

            if let Err(e) = notifier.notify_updated_ip_detected(record).await {
                warn!(error = %e, "could not send notification");
                metrics::record_notification_error();
            }
            return true;
        }

        if let ConvergenceState::Confirmed { last_known } = &mut self.state {
            *last_known = record.clone();
        }

        match lookup.lookup(&record.host).await {
            Ok(ips) if !record_matches(&ips, record) => {
                info!(host = %record.host, "detected changed DNS record");
                self.set_state(self.fresh_unconfirmed());
            }
            Ok(_) => {}
            Err(e) => {
                debug!(host = %record.host, error = %e, "confirming lookup failed");
            }
        }

        false
    }

    /// How long to sleep before the next tick.
    pub fn wait_interval(&self) -> Duration {
        match &self.state {
            ConvergenceState::Initial => self.config.resolve_interval,
            ConvergenceState::Unconfirmed { wait_interval, .. } => *wait_interval,
            ConvergenceState::Confirmed { .. } => {
                jittered(self.config.resolve_interval, self.config.confirmed_jitter)
            }
        }
    }
}

/// `base` shifted by a uniform offset in `[-jitter, +jitter]`, at least one second.
fn jittered(base: Duration, jitter: Duration) -> Duration {
    let bound = jitter.as_millis() as i64;
    if bound == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-bound..=bound);
    let millis = (base.as_millis() as i64 + offset).max(1_000);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DyndnsError;
    use crate::notification::NoopNotifier;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Lookup returning a switchable canned answer.
    struct CannedLookup {
        answer: Mutex<Option<Vec<IpAddr>>>,
    }

    impl CannedLookup {
        fn answering(ips: &[&str]) -> Self {
            Self {
                answer: Mutex::new(Some(ips.iter().map(|ip| ip.parse().unwrap()).collect())),
            }
        }

        fn failing() -> Self {
            Self {
                answer: Mutex::new(None),
            }
        }

        fn set(&self, ips: &[&str]) {
            *self.answer.lock().unwrap() = Some(ips.iter().map(|ip| ip.parse().unwrap()).collect());
        }
    }

    #[async_trait]
    impl AddressLookup for CannedLookup {
        async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DyndnsError> {
            self.answer.lock().unwrap().clone().ok_or_else(|| DyndnsError::Lookup {
                host: host.to_string(),
                reason: "SERVFAIL".into(),
            })
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        detected: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify_updated_ip_detected(&self, _record: &DnsRecord) -> Result<(), DyndnsError> {
            self.detected.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DyndnsError::Notification("smtp down".into()));
            }
            Ok(())
        }

        async fn notify_updated_ip_applied(&self, _record: &DnsRecord) -> Result<(), DyndnsError> {
            Ok(())
        }
    }

    fn record(ip: &str) -> DnsRecord {
        DnsRecord::new("home.example.com").with_ipv4(ip.parse().unwrap())
    }

    fn machine() -> StateMachine {
        StateMachine::new("home.example.com", StateMachineConfig::default())
    }

    fn confirmed_machine(ip: &str) -> StateMachine {
        let mut m = machine();
        m.set_state(ConvergenceState::Confirmed {
            last_known: record(ip),
        });
        m
    }

    #[tokio::test]
    async fn test_initial_delegates_to_unconfirmed() {
        let mut m = machine();
        let lookup = CannedLookup::answering(&["198.51.100.1"]);

        let send = m.evaluate(&record("203.0.113.5"), &lookup, &NoopNotifier).await;

        assert!(!send);
        assert_eq!(
            m.state(),
            &ConvergenceState::Unconfirmed {
                checks: 1,
                wait_interval: DEFAULT_UNCONFIRMED_INTERVAL
            }
        );
    }

    #[tokio::test]
    async fn test_initial_force_send() {
        let mut m = StateMachine::new(
            "home.example.com",
            StateMachineConfig {
                force_send_on_start: true,
                ..Default::default()
            },
        );
        let lookup = CannedLookup::answering(&["203.0.113.5"]);

        assert!(m.evaluate(&record("203.0.113.5"), &lookup, &NoopNotifier).await);
        assert_eq!(m.state().name(), "unconfirmed");
    }

    #[tokio::test]
    async fn test_unconfirmed_resends_every_tenth_check() {
        let mut m = machine();
        m.set_state(m.fresh_unconfirmed());
        let lookup = CannedLookup::answering(&["198.51.100.1"]);
        let r = record("203.0.113.5");

        let mut sends = Vec::new();
        for call in 1..=50 {
            if m.evaluate(&r, &lookup, &NoopNotifier).await {
                sends.push(call);
            }
        }

        assert_eq!(sends, vec![10, 20, 30, 40, 50]);
    }

    #[tokio::test]
    async fn test_unconfirmed_converges() {
        let mut m = machine();
        m.set_state(m.fresh_unconfirmed());
        let lookup = CannedLookup::answering(&["203.0.113.5"]);

        let send = m.evaluate(&record("203.0.113.5"), &lookup, &NoopNotifier).await;

        assert!(!send);
        assert_eq!(
            m.state(),
            &ConvergenceState::Confirmed {
                last_known: record("203.0.113.5")
            }
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_lookup_failure_sends() {
        let mut m = machine();
        m.set_state(m.fresh_unconfirmed());
        let lookup = CannedLookup::failing();

        assert!(m.evaluate(&record("203.0.113.5"), &lookup, &NoopNotifier).await);
        assert_eq!(m.state().name(), "unconfirmed");
    }

    #[tokio::test]
    async fn test_confirmed_new_ip_sends_and_notifies() {
        let mut m = confirmed_machine("203.0.113.5");
        let lookup = CannedLookup::answering(&["203.0.113.5"]);
        let notifier = CountingNotifier::default();

        let send = m.evaluate(&record("203.0.113.9"), &lookup, &notifier).await;

        assert!(send);
        assert_eq!(m.state().name(), "unconfirmed");
        assert_eq!(notifier.detected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_confirmed_notification_failure_is_ignored() {
        let mut m = confirmed_machine("203.0.113.5");
        let lookup = CannedLookup::answering(&["203.0.113.5"]);
        let notifier = CountingNotifier {
            fail: true,
            ..Default::default()
        };

        assert!(m.evaluate(&record("203.0.113.9"), &lookup, &notifier).await);
    }

    #[tokio::test]
    async fn test_confirmed_unchanged_stays_confirmed() {
        let mut m = confirmed_machine("203.0.113.5");
        let lookup = CannedLookup::answering(&["203.0.113.5"]);

        assert!(!m.evaluate(&record("203.0.113.5"), &lookup, &NoopNotifier).await);
        assert_eq!(m.state().name(), "confirmed");
    }

    #[tokio::test]
    async fn test_confirmed_reverted_dns_falls_back_without_sending() {
        let mut m = confirmed_machine("203.0.113.5");
        let lookup = CannedLookup::answering(&["198.51.100.1"]);
        let r = record("203.0.113.5");

        assert!(!m.evaluate(&r, &lookup, &NoopNotifier).await);
        assert_eq!(
            m.state(),
            &ConvergenceState::Unconfirmed {
                checks: 0,
                wait_interval: DEFAULT_UNCONFIRMED_INTERVAL
            }
        );

        // The resend only happens once the unconfirmed cadence fires.
        let mut sends = 0;
        for _ in 0..RESEND_EVERY_CHECKS {
            if m.evaluate(&r, &lookup, &NoopNotifier).await {
                sends += 1;
            }
        }
        assert_eq!(sends, 1);

        lookup.set(&["203.0.113.5"]);
        assert!(!m.evaluate(&r, &lookup, &NoopNotifier).await);
        assert_eq!(m.state().name(), "confirmed");
    }

    #[tokio::test]
    async fn test_confirmed_lookup_failure_keeps_state() {
        let mut m = confirmed_machine("203.0.113.5");
        let lookup = CannedLookup::failing();

        assert!(!m.evaluate(&record("203.0.113.5"), &lookup, &NoopNotifier).await);
        assert_eq!(m.state().name(), "confirmed");
    }

    #[test]
    fn test_wait_intervals() {
        let mut m = machine();
        assert_eq!(m.wait_interval(), DEFAULT_RESOLVE_INTERVAL);

        m.set_state(m.fresh_unconfirmed());
        assert_eq!(m.wait_interval(), DEFAULT_UNCONFIRMED_INTERVAL);

        m.set_state(ConvergenceState::Confirmed {
            last_known: record("203.0.113.5"),
        });
        for _ in 0..100 {
            let wait = m.wait_interval();
            assert!(wait >= DEFAULT_RESOLVE_INTERVAL - DEFAULT_CONFIRMED_JITTER);
            assert!(wait <= DEFAULT_RESOLVE_INTERVAL + DEFAULT_CONFIRMED_JITTER);
        }
    }

    #[test]
    fn test_jitter_disabled() {
        let base = Duration::from_secs(45);
        assert_eq!(jittered(base, Duration::ZERO), base);
    }

    #[test]
    fn test_transition_updates_timestamp() {
        let mut m = machine();
        let before = m.last_state_change();
        std::thread::sleep(Duration::from_millis(5));
        m.set_state(m.fresh_unconfirmed());
        assert!(m.last_state_change() > before);
    }
}
