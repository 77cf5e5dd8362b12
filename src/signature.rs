//! Ed25519 signing and verification of [`DnsRecord`] claims.
//!
//! Signing is deterministic: the same record always yields the same
//! signature.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::error::DyndnsError;
use crate::record::DnsRecord;

/// Capability to check a signature against a record.
pub trait VerificationKey: Send + Sync {
    /// True if `signature` (base64) is valid for `record`.
    ///
    /// Malformed signatures simply do not verify.
    fn verify(&self, signature: &str, record: &DnsRecord) -> bool;
}

/// Capability to sign records, in addition to verifying them.
pub trait SignatureKeypair: VerificationKey {
    /// Base64 signature over the record's canonical hash.
    fn sign(&self, record: &DnsRecord) -> Result<String, DyndnsError>;
}

/// Ed25519 key, either a full keypair or a bare public key.
#[derive(Clone)]
pub struct Keypair {
    verifying_key: VerifyingKey,
    signing_key: Option<SigningKey>,
}

/// On-disk representation.
#[derive(Serialize, Deserialize)]
struct SerializedKeypair {
    public_key: String,
    private_key: String,
}

impl Keypair {
    /// Mint a fresh random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            verifying_key: signing_key.verifying_key(),
            signing_key: Some(signing_key),
        }
    }

    /// Build a verification-only key from a base64 public key.
    pub fn from_public_key_base64(public_key: &str) -> Result<Self, DyndnsError> {
        let raw = STANDARD
            .decode(public_key.trim())
            .map_err(|e| DyndnsError::Keypair(format!("couldn't decode public key: {}", e)))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| DyndnsError::Keypair("public key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| DyndnsError::Keypair(format!("invalid public key: {}", e)))?;

        Ok(Self {
            verifying_key,
            signing_key: None,
        })
    }

    /// Base64 encoding of the public half.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.verifying_key.to_bytes())
    }

    /// Whether this key can sign.
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Serialize to the `{public_key, private_key}` JSON document.
    pub fn to_json(&self) -> Result<Vec<u8>, DyndnsError> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| DyndnsError::Keypair("no private key to serialize".into()))?;
        let serialized = SerializedKeypair {
            public_key: self.public_key_base64(),
            private_key: STANDARD.encode(signing_key.to_keypair_bytes()),
        };
        Ok(serde_json::to_vec(&serialized)?)
    }

    /// Parse the `{public_key, private_key}` JSON document.
    ///
    /// `private_key` may be the 64-byte keypair encoding or a 32-byte seed.
    pub fn from_json(content: &[u8]) -> Result<Self, DyndnsError> {
        let serialized: SerializedKeypair = serde_json::from_slice(content)?;
        let private = STANDARD
            .decode(serialized.private_key.trim())
            .map_err(|e| DyndnsError::Keypair(format!("couldn't decode private key: {}", e)))?;

        let signing_key = match private.len() {
            64 => {
                let mut bytes = [0u8; 64];
                bytes.copy_from_slice(&private);
                SigningKey::from_keypair_bytes(&bytes)
                    .map_err(|e| DyndnsError::Keypair(format!("invalid private key: {}", e)))?
            }
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&private);
                SigningKey::from_bytes(&seed)
            }
            n => {
                return Err(DyndnsError::Keypair(format!(
                    "private key has unexpected length {}",
                    n
                )))
            }
        };

        let public = Self::from_public_key_base64(&serialized.public_key)?;
        if public.verifying_key != signing_key.verifying_key() {
            return Err(DyndnsError::Keypair(
                "public key does not match private key".into(),
            ));
        }

        Ok(Self {
            verifying_key: public.verifying_key,
            signing_key: Some(signing_key),
        })
    }

    /// Read a keypair from `path`.
    pub fn from_file(path: &Path) -> Result<Self, DyndnsError> {
        let content = std::fs::read(path)?;
        let keypair = Self::from_json(&content)?;
        info!(
            path = %path.display(),
            public_key = %keypair.public_key_base64(),
            "read keypair"
        );
        Ok(keypair)
    }

    /// Persist this keypair to `path`, readable by the owner only.
    pub fn to_file(&self, path: &Path) -> Result<(), DyndnsError> {
        let content = self.to_json()?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;

        // mode() only applies on creation
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(&content)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read the keypair at `path`, minting and saving a new one if it is unreadable.
    ///
    /// A fresh keypair means the server's known hosts must be updated to the
    /// new public key.
    pub fn load_or_generate(path: &Path) -> Result<Self, DyndnsError> {
        match Self::from_file(path) {
            Ok(keypair) => Ok(keypair),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read keypair, creating a new one");
                let keypair = Self::generate();
                keypair.to_file(path)?;
                info!(
                    path = %path.display(),
                    public_key = %keypair.public_key_base64(),
                    "saved new keypair"
                );
                Ok(keypair)
            }
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_base64())
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

impl VerificationKey for Keypair {
    fn verify(&self, signature: &str, record: &DnsRecord) -> bool {
        let Ok(raw) = STANDARD.decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&raw) else {
            return false;
        };
        self.verifying_key
            .verify(record.hash().as_bytes(), &signature)
            .is_ok()
    }
}

impl SignatureKeypair for Keypair {
    fn sign(&self, record: &DnsRecord) -> Result<String, DyndnsError> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| DyndnsError::Keypair("verification-only key cannot sign".into()))?;
        let signature = signing_key.sign(record.hash().as_bytes());
        Ok(STANDARD.encode(signature.to_bytes()))
    }
}
