//! Client process loop: discover, evaluate, maybe send.

use std::sync::Arc;
use tracing::{debug, info, warn};
use tripwire::Tripwire;

use crate::error::DyndnsError;
use crate::lookup::AddressLookup;
use crate::metrics::{self, ResolveResult};
use crate::notification::Notifier;
use crate::reconciler::Reconciler;
use crate::record::{DnsRecord, UpdateRecordRequest};
use crate::resolver::AddressResolver;
use crate::signature::SignatureKeypair;
use crate::state::{StateMachine, StateMachineConfig};

/// Keeps one host's DNS record pointed at the client's current address.
pub struct Client {
    resolver: Arc<dyn AddressResolver>,
    keypair: Arc<dyn SignatureKeypair>,
    reconciler: Arc<Reconciler>,
    lookup: Arc<dyn AddressLookup>,
    notifier: Arc<dyn Notifier>,
    machine: StateMachine,
}

impl Client {
    /// Create a client for the resolver's host.
    pub fn new(
        resolver: Arc<dyn AddressResolver>,
        keypair: Arc<dyn SignatureKeypair>,
        reconciler: Arc<Reconciler>,
        lookup: Arc<dyn AddressLookup>,
        notifier: Arc<dyn Notifier>,
        config: StateMachineConfig,
    ) -> Self {
        let machine = StateMachine::new(resolver.host(), config);
        Self {
            resolver,
            keypair,
            reconciler,
            lookup,
            notifier,
            machine,
        }
    }

    /// The convergence state machine.
    pub fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    /// The reconciler delivering this client's updates.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    async fn discover(&self) -> Result<DnsRecord, DyndnsError> {
        let host = self.resolver.host();
        let name = self.resolver.name();

        let record = match self.resolver.resolve().await {
            Ok(record) => record,
            Err(e) => {
                metrics::record_ip_resolve(host, name, ResolveResult::Error);
                return Err(e);
            }
        };

        if !record.is_valid() {
            metrics::record_ip_resolve(host, name, ResolveResult::Invalid);
            return Err(DyndnsError::Resolve(format!(
                "discovered address is invalid: {}",
                record
            )));
        }

        metrics::record_ip_resolve(host, name, ResolveResult::Success);
        Ok(record)
    }

    /// Run one discovery-evaluate-maybe-send cycle.
    ///
    /// Returns the record to carry into the next cycle: the fresh record,
    /// or `prev` if discovery failed.
    pub async fn resolve(
        &mut self,
        prev: Option<DnsRecord>,
    ) -> (Option<DnsRecord>, Result<(), DyndnsError>) {
        let record = match self.discover().await {
            Ok(record) => record,
            Err(e) => return (prev, Err(e)),
        };
        debug!(record = %record, "discovered address");

        let send = self
            .machine
            .evaluate(&record, self.lookup.as_ref(), self.notifier.as_ref())
            .await;
        if !send {
            return (Some(record), Ok(()));
        }

        let signature = match self.keypair.sign(&record) {
            Ok(signature) => signature,
            Err(e) => return (Some(record), Err(e)),
        };

        let request = UpdateRecordRequest::new(record.clone(), signature);
        let result = self.reconciler.register_update(request).await;
        (Some(record), result)
    }

    /// Single cycle for one-shot mode.
    pub async fn run_once(&mut self) -> Result<DnsRecord, DyndnsError> {
        match self.resolve(None).await {
            (Some(record), Ok(())) => Ok(record),
            (_, Err(e)) => Err(e),
            (None, Ok(())) => Err(DyndnsError::Resolve("no address discovered".into())),
        }
    }

    /// Tick until the tripwire fires, retrying deliveries in the background.
    pub async fn run(mut self, mut tripwire: Tripwire) {
        info!(
            host = %self.resolver.host(),
            resolver = self.resolver.name(),
            dispatchers = ?self.reconciler.dispatcher_names().collect::<Vec<_>>(),
            "starting client"
        );

        let ticker = tokio::spawn(self.reconciler.clone().run(tripwire.clone()));

        let mut record = None;
        loop {
            let (next, result) = self.resolve(record.take()).await;
            record = next;
            if let Err(e) = result {
                warn!(host = %self.resolver.host(), error = %e, "error while iteration");
            }

            let wait = self.machine.wait_interval();
            debug!(state = self.machine.state().name(), ?wait, "sleeping until next tick");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut tripwire => {
                    info!("client shutting down");
                    break;
                }
            }
        }

        let _ = ticker.await;
        info!("client stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ChannelDispatcher, Dispatcher};
    use crate::notification::NoopNotifier;
    use crate::propagator::MemoryZone;
    use crate::reconciler::ReconcilerConfig;
    use crate::resolver::StaticResolver;
    use crate::signature::{Keypair, VerificationKey};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn client(
        ip: &str,
        keypair: Keypair,
        zone: &MemoryZone,
    ) -> (Client, mpsc::Receiver<UpdateRecordRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let dispatchers = BTreeMap::from([(
            "local".to_string(),
            Arc::new(ChannelDispatcher::new(tx)) as Arc<dyn Dispatcher>,
        )]);
        let reconciler = Reconciler::new(dispatchers, ReconcilerConfig::default()).unwrap();
        let resolver =
            StaticResolver::new("home.example.com", Some(ip.parse().unwrap()), None).unwrap();

        let client = Client::new(
            Arc::new(resolver),
            Arc::new(keypair),
            Arc::new(reconciler),
            Arc::new(zone.clone()),
            Arc::new(NoopNotifier),
            StateMachineConfig::default(),
        );
        (client, rx)
    }

    #[tokio::test]
    async fn test_first_cycle_sends_signed_update() {
        let keypair = Keypair::generate();
        let verifier = Keypair::from_public_key_base64(&keypair.public_key_base64()).unwrap();
        let zone = MemoryZone::default();
        let (mut client, mut rx) = client("203.0.113.5", keypair, &zone);

        let record = client.run_once().await.unwrap();

        let request = rx.try_recv().unwrap();
        assert_eq!(request.record, record);
        assert!(verifier.verify(&request.signature, &request.record));
        assert_eq!(client.state_machine().state().name(), "unconfirmed");
    }

    #[tokio::test]
    async fn test_converged_record_is_not_sent() {
        let zone = MemoryZone::default();
        zone.upsert(&DnsRecord::new("home.example.com").with_ipv4("203.0.113.5".parse().unwrap()))
            .unwrap();
        let (mut client, mut rx) = client("203.0.113.5", Keypair::generate(), &zone);

        client.run_once().await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(client.state_machine().state().name(), "confirmed");
    }

    #[tokio::test]
    async fn test_invalid_address_keeps_previous() {
        let zone = MemoryZone::default();
        let (mut client, mut rx) = client("192.168.1.10", Keypair::generate(), &zone);
        let prev = DnsRecord::new("home.example.com").with_ipv4("203.0.113.5".parse().unwrap());

        let (record, result) = client.resolve(Some(prev.clone())).await;

        assert_eq!(record, Some(prev));
        assert!(matches!(result, Err(DyndnsError::Resolve(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(client.state_machine().state().name(), "initial");
    }

    #[tokio::test]
    async fn test_verification_only_key_cannot_send() {
        let zone = MemoryZone::default();
        let public = Keypair::from_public_key_base64(&Keypair::generate().public_key_base64()).unwrap();
        let (mut client, mut rx) = client("203.0.113.5", public, &zone);

        let err = client.run_once().await.unwrap_err();

        assert!(matches!(err, DyndnsError::Keypair(_)));
        assert!(rx.try_recv().is_err());
    }
}
