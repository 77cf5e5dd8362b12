//! Best-effort notifications about detected and applied address changes.

use async_trait::async_trait;

use crate::error::DyndnsError;
use crate::record::DnsRecord;

/// Sink for address-change notifications.
///
/// Failures are counted by the caller and never fail the surrounding
/// operation.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The client discovered a new address.
    async fn notify_updated_ip_detected(&self, record: &DnsRecord) -> Result<(), DyndnsError>;

    /// The server wrote a new address to DNS.
    async fn notify_updated_ip_applied(&self, record: &DnsRecord) -> Result<(), DyndnsError>;
}

/// Notifier that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_updated_ip_detected(&self, _record: &DnsRecord) -> Result<(), DyndnsError> {
        Ok(())
    }

    async fn notify_updated_ip_applied(&self, _record: &DnsRecord) -> Result<(), DyndnsError> {
        Ok(())
    }
}
