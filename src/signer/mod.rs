//! Trust services: where server-held private keys live.
//!
//! The notary server never touches private key bytes directly.  It
//! asks a [`TrustService`] to create keys and to sign digests.  Two
//! implementations exist:
//!
//! * [`LocalSigner`] keeps keys in process (optionally persisted to a
//!   JSON key file);
//! * [`RemoteSigner`] forwards every request to a separate signing
//!   service over mutually authenticated TLS.  The same protocol is
//!   served by [`SigningService`], which wraps a `LocalSigner`.
//!
//! The variant is picked once from configuration by [`from_config`].
//! A remote signer that cannot be reached is an error for the
//! caller; there is no fallback to local signing.

pub mod local;
pub mod remote;
pub mod service;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TrustServiceConfig;
use crate::error::SignerError;
use crate::tuf::{Digest, KeyId, KeyRecord, Role, Signature};

pub use local::LocalSigner;
pub use remote::RemoteSigner;
pub use service::SigningService;

#[async_trait]
pub trait TrustService: Send + Sync {
    /// Create a fresh Ed25519 key for `role`.
    async fn generate_key(&self, role: Role) -> Result<KeyRecord, SignerError>;

    /// Sign `digest` with the private half of `key_id`.
    async fn sign(&self, key_id: &KeyId, digest: &Digest) -> Result<Signature, SignerError>;
}

/// Build the trust service selected in the configuration.
pub async fn from_config(config: &TrustServiceConfig) -> Result<Arc<dyn TrustService>> {
    match config {
        TrustServiceConfig::Local { key_file: None } => Ok(Arc::new(LocalSigner::new())),
        TrustServiceConfig::Local { key_file: Some(path) } => Ok(Arc::new(LocalSigner::with_key_file(path).await?)),
        TrustServiceConfig::Remote(remote) => Ok(Arc::new(RemoteSigner::from_config(remote)?)),
    }
}
