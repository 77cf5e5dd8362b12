//! Multi-destination reconciler.
//!
//! Holds the single outstanding claim and the set of channels that have not
//! accepted it yet. Every dispatch round fans the claim out to all pending
//! channels concurrently; successful channels leave the pending set once
//! the round has joined. A periodic ticker retries whatever is left until
//! a newer claim supersedes the batch.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tripwire::Tripwire;

use crate::dispatch::Dispatcher;
use crate::error::{DispatchErrors, DyndnsError};
use crate::metrics::{self, DispatchResult, Timer};
use crate::record::UpdateRecordRequest;

/// Period of the retry ticker.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound for a single channel delivery.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconciler tunables.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Abandon the remaining channels once any channel accepted the claim.
    pub stop_after_first_success: bool,
    /// Timeout applied to every individual delivery.
    pub dispatch_timeout: Duration,
    /// Period of the retry ticker.
    pub retry_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stop_after_first_success: false,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct Batch {
    request: Option<UpdateRecordRequest>,
    pending: BTreeSet<String>,
}

/// Fans one outstanding claim out to a fixed set of named channels.
pub struct Reconciler {
    dispatchers: BTreeMap<String, Arc<dyn Dispatcher>>,
    batch: Mutex<Batch>,
    config: ReconcilerConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("dispatchers", &self.dispatchers.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler over the given channels; at least one is required.
    pub fn new(
        dispatchers: BTreeMap<String, Arc<dyn Dispatcher>>,
        config: ReconcilerConfig,
    ) -> Result<Self, DyndnsError> {
        if dispatchers.is_empty() {
            return Err(DyndnsError::Config("no dispatchers configured".into()));
        }

        Ok(Self {
            dispatchers,
            batch: Mutex::new(Batch::default()),
            config,
        })
    }

    /// Names of all configured channels.
    pub fn dispatcher_names(&self) -> impl Iterator<Item = &str> {
        self.dispatchers.keys().map(String::as_str)
    }

    /// Channels that have not accepted the current claim yet.
    pub async fn pending(&self) -> BTreeSet<String> {
        self.batch.lock().await.pending.clone()
    }

    /// The claim currently being delivered, if any.
    pub async fn current_request(&self) -> Option<UpdateRecordRequest> {
        self.batch.lock().await.request.clone()
    }

    /// Replace the outstanding claim and deliver it to every channel.
    ///
    /// Whatever was still pending for a previous claim is discarded. Waits
    /// for a running retry round to finish before replacing the batch.
    pub async fn register_update(&self, request: UpdateRecordRequest) -> Result<(), DyndnsError> {
        let mut batch = self.batch.lock().await;

        if let Some(previous) = &batch.request {
            if !batch.pending.is_empty() {
                debug!(
                    host = %previous.record.host,
                    abandoned = ?batch.pending,
                    "superseding outstanding update"
                );
            }
        }

        info!(
            host = %request.record.host,
            ipv4 = ?request.record.ipv4,
            ipv6 = ?request.record.ipv6,
            "registering update"
        );
        batch.request = Some(request);
        batch.pending = self.dispatchers.keys().cloned().collect();

        self.dispatch_locked(&mut batch).await
    }

    /// Deliver the current claim to every pending channel.
    ///
    /// No-op while nothing is pending.
    pub async fn dispatch(&self) -> Result<(), DyndnsError> {
        let mut batch = self.batch.lock().await;
        self.dispatch_locked(&mut batch).await
    }

    async fn dispatch_locked(&self, batch: &mut Batch) -> Result<(), DyndnsError> {
        let Some(request) = batch.request.as_ref() else {
            return Ok(());
        };
        if batch.pending.is_empty() {
            return Ok(());
        }

        let timer = Timer::start();
        let timeout = self.config.dispatch_timeout;
        let deliveries = batch
            .pending
            .iter()
            .filter_map(|name| self.dispatchers.get_key_value(name))
            .map(|(name, dispatcher)| async move {
                let outcome = tokio::time::timeout(timeout, dispatcher.notify(request)).await;
                (name.clone(), outcome)
            });
        let outcomes = join_all(deliveries).await;
        let host = request.record.host.clone();
        metrics::record_dispatch_round(timer.elapsed());

        let mut errors = DispatchErrors::default();
        let mut delivered = 0usize;
        for (name, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => {
                    debug!(host = %host, dispatcher = %name, "update delivered");
                    metrics::record_dispatch(&name, DispatchResult::Success);
                    batch.pending.remove(&name);
                    delivered += 1;
                }
                Ok(Err(e)) => {
                    warn!(host = %host, dispatcher = %name, error = %e, "delivery failed");
                    metrics::record_dispatch(&name, DispatchResult::Error);
                    errors.push(name, e);
                }
                Err(_) => {
                    warn!(host = %host, dispatcher = %name, ?timeout, "delivery timed out");
                    metrics::record_dispatch(&name, DispatchResult::Timeout);
                    errors.push(name, format!("timed out after {:?}", timeout));
                }
            }
        }

        if self.config.stop_after_first_success && delivered > 0 && !batch.pending.is_empty() {
            info!(
                host = %host,
                abandoned = ?batch.pending,
                "update delivered, not retrying remaining dispatchers"
            );
            batch.pending.clear();
            metrics::record_pending(&host, 0);
            return Ok(());
        }

        metrics::record_pending(&host, batch.pending.len());
        errors.into_result()
    }

    /// Retry pending deliveries periodically until the tripwire fires.
    pub async fn run(self: Arc<Self>, mut tripwire: Tripwire) {
        let period = self.config.retry_interval;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.dispatch().await {
                        warn!(error = %e, "retrying update failed");
                    }
                }
                _ = &mut tripwire => {
                    debug!("reconciler shutting down");
                    return;
                }
            }
        }
    }
}
