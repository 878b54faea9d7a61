//! Public keys, key identifiers and signatures as they appear in
//! metadata.
//!
//! Keys are Ed25519.  A key's identifier is the hex SHA-256 of the
//! key's canonical JSON, so two parties holding the same public key
//! always agree on its ID without any registry.  Private keys never
//! appear in this module; they live behind a
//! [`TrustService`](crate::signer::TrustService).

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};

use super::canonical::sha256_hex;
use super::role::Role;

/// Signature method string for Ed25519.
pub const ED25519: &str = "ed25519";

/// Hex encoded key identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        KeyId(s.to_string())
    }
}

/// Key algorithm.  Only Ed25519 is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "ed25519")]
    Ed25519,
}

/// The `keyval` object of a public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Base64 encoded raw public key.
    pub public: String,
}

/// A public key as listed in root metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: KeyType,
    pub keyval: KeyValue,
}

impl PublicKey {
    /// Wrap an Ed25519 verifying key.
    pub fn from_ed25519(key: &VerifyingKey) -> Self {
        Self {
            keytype: KeyType::Ed25519,
            keyval: KeyValue {
                public: BASE64.encode(key.as_bytes()),
            },
        }
    }

    /// Compute the key identifier.  The canonical form of a public
    /// key is fixed, so it is written out directly rather than going
    /// through the generic encoder.
    pub fn key_id(&self) -> KeyId {
        let canonical = format!(
            r#"{{"keytype":"{}","keyval":{{"public":"{}"}}}}"#,
            ED25519, self.keyval.public
        );
        KeyId(sha256_hex(canonical.as_bytes()))
    }

    /// Decode into a verifying key.  Returns `None` if the encoded
    /// value is not a valid Ed25519 point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        let raw = BASE64.decode(&self.keyval.public).ok()?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = raw.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }
}

/// A key created by a trust service, together with the role it was
/// created for.  Records are stored per collection for server-held
/// keys; root metadata refers to them only by ID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyId,
    pub role: Role,
    pub public: PublicKey,
}

impl KeyRecord {
    pub fn new(role: Role, public: PublicKey) -> Self {
        Self {
            id: public.key_id(),
            role,
            public,
        }
    }
}

/// A signature attached to a metadata envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: KeyId,
    /// Signature method.  Kept as free text so that an envelope
    /// carrying signatures of an unsupported method still parses;
    /// such entries are simply never counted as valid.
    pub method: String,
    /// Base64 encoded signature bytes.
    pub sig: String,
}

impl Signature {
    pub fn from_ed25519(keyid: KeyId, sig: &ed25519_dalek::Signature) -> Self {
        Self {
            keyid,
            method: ED25519.to_string(),
            sig: BASE64.encode(sig.to_bytes()),
        }
    }

    /// Decode the signature bytes if this is a well formed Ed25519
    /// signature.
    pub fn as_ed25519(&self) -> Option<ed25519_dalek::Signature> {
        if self.method != ED25519 {
            return None;
        }
        let raw = BASE64.decode(&self.sig).ok()?;
        let bytes: [u8; SIGNATURE_LENGTH] = raw.try_into().ok()?;
        Some(ed25519_dalek::Signature::from_bytes(&bytes))
    }
}
