//! Error types for dyndns.

use std::fmt;

use thiserror::Error;

/// Errors that can occur on either side of the update protocol.
#[derive(Debug, Error)]
pub enum DyndnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Configuration source could not be loaded.
    #[error("Configuration error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Claim or record is structurally incomplete.
    #[error("invalid update request: {0}")]
    InvalidRequest(String),

    /// No verification keys are configured for the claimed host.
    #[error("message for unknown host '{0}' received")]
    UnknownHost(String),

    /// None of the host's keys verified the signature.
    #[error("verifying signature failed for host '{0}'")]
    SignatureMismatch(String),

    /// Claim timestamp lies outside the grace window.
    #[error("message timestamp is too old")]
    MessageTooOld,

    /// One or more delivery channels failed during a dispatch round.
    #[error("{0}")]
    Dispatch(DispatchErrors),

    /// The DNS provider rejected or failed the change.
    #[error("could not propagate dns change for host '{host}': {reason}")]
    Propagation {
        /// Host whose records were being written.
        host: String,
        /// Provider-side failure description.
        reason: String,
    },

    /// A best-effort notification could not be delivered.
    #[error("notification failed: {0}")]
    Notification(String),

    /// Live DNS lookup failed.
    #[error("could not resolve host {host}: {reason}")]
    Lookup {
        /// Host that was looked up.
        host: String,
        /// Resolver failure description.
        reason: String,
    },

    /// Address discovery failed.
    #[error("error while resolving ip: {0}")]
    Resolve(String),

    /// Key material is missing, malformed or cannot sign.
    #[error("keypair error: {0}")]
    Keypair(String),
}

impl DyndnsError {
    /// True for the staleness class, which callers usually log quietly.
    pub fn is_too_old(&self) -> bool {
        matches!(self, DyndnsError::MessageTooOld)
    }
}

/// Failures collected from one concurrent dispatch round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchErrors {
    failures: Vec<(String, String)>,
}

impl DispatchErrors {
    /// Record a failure for the named channel.
    pub fn push(&mut self, dispatcher: impl Into<String>, reason: impl fmt::Display) {
        self.failures.push((dispatcher.into(), reason.to_string()));
    }

    /// True if no channel failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Names of the channels that failed.
    pub fn dispatchers(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(name, _)| name.as_str())
    }

    /// Convert into a result, `Ok` if nothing failed.
    pub fn into_result(mut self) -> Result<(), DyndnsError> {
        if self.failures.is_empty() {
            return Ok(());
        }
        self.failures.sort();
        Err(DyndnsError::Dispatch(self))
    }
}

impl fmt::Display for DispatchErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, reason) in &self.failures {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "reconciliation for dispatcher {} failed: {}", name, reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_dispatch_errors_is_ok() {
        assert!(DispatchErrors::default().into_result().is_ok());
    }

    #[test]
    fn test_dispatch_errors_name_every_channel() {
        let mut errs = DispatchErrors::default();
        errs.push("mqtt", "broker unreachable");
        errs.push("http", "status 502");

        let err = errs.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dispatcher mqtt failed: broker unreachable"));
        assert!(msg.contains("dispatcher http failed: status 502"));
    }

    #[test]
    fn test_too_old_is_distinguished() {
        assert!(DyndnsError::MessageTooOld.is_too_old());
        assert!(!DyndnsError::UnknownHost("a".into()).is_too_old());
    }
}
