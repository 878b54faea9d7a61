//! Signed metadata documents.
//!
//! Every document travels as an envelope of the form
//! `{"signed": {...}, "signatures": [...]}`.  The server never
//! re-encodes a document it accepted: the exact submitted bytes are
//! what gets stored, hashed and served.  Parsing therefore keeps
//! three things side by side: the raw bytes, the untyped `signed`
//! value (from which the signing digest is computed, unknown fields
//! included) and a typed view used for validation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::canonical::{sha256_hex, signing_digest, Digest};
use super::keys::{KeyId, PublicKey, Signature};
use super::role::Role;
use crate::error::MetadataError;

/// Wire envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedEnvelope<T = serde_json::Value> {
    pub signed: T,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

/// Key set and threshold for one role as declared in root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
}

/// Keys allowed to sign a role, resolved against root's key table,
/// plus the threshold that applies.
#[derive(Clone, Debug, Default)]
pub struct AuthorizedKeys {
    pub keys: BTreeMap<KeyId, PublicKey>,
    pub threshold: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootMeta {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<KeyId, PublicKey>,
    pub roles: BTreeMap<Role, RoleKeys>,
    #[serde(default)]
    pub consistent_snapshot: bool,
}

impl RootMeta {
    /// Resolve the keys this root authorises for `role`.  Key IDs
    /// listed for the role but absent from the key table are
    /// skipped; a role root does not mention at all resolves to an
    /// empty set with threshold 0, which no verification accepts.
    pub fn authorized_keys(&self, role: Role) -> AuthorizedKeys {
        let Some(role_keys) = self.roles.get(&role) else {
            return AuthorizedKeys::default();
        };
        let keys = role_keys
            .keyids
            .iter()
            .filter_map(|id| self.keys.get(id).map(|k| (id.clone(), k.clone())))
            .collect();
        AuthorizedKeys {
            keys,
            threshold: role_keys.threshold,
        }
    }

    /// Every listed key must hash to the ID it is listed under.
    fn check_key_ids(&self) -> Result<(), MetadataError> {
        for (id, key) in &self.keys {
            if &key.key_id() != id {
                return Err(MetadataError::KeyIdMismatch(id.clone()));
            }
        }
        Ok(())
    }
}

/// Length and hashes of a target file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetsMeta {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub targets: BTreeMap<String, FileMeta>,
}

/// A consistency reference: the exact version, length and SHA-256
/// of another role's stored bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRef {
    pub version: u64,
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

impl MetaRef {
    /// Describe `bytes`, committed (or about to be) at `version`.
    pub fn describe(version: u64, bytes: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256_hex(bytes));
        Self {
            version,
            length: bytes.len() as u64,
            hashes,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }

    /// Explain why `bytes` at `version` is not what this reference
    /// points at, or `None` if it matches exactly.
    pub fn mismatch(&self, version: u64, bytes: &[u8]) -> Option<String> {
        if self.version != version {
            return Some(format!("version {} is not {}", self.version, version));
        }
        if self.length != bytes.len() as u64 {
            return Some(format!("length {} is not {}", self.length, bytes.len()));
        }
        match self.sha256() {
            None => Some("no sha256 hash recorded".to_string()),
            Some(h) if h != sha256_hex(bytes) => Some(format!("sha256 {h} does not match")),
            Some(_) => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// Keyed by role name.  Entries for names that are not top
    /// level roles are tolerated and ignored.
    pub meta: BTreeMap<String, MetaRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimestampMeta {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaRef>,
}

impl TimestampMeta {
    /// Build a timestamp pointing at the given snapshot bytes.
    pub fn for_snapshot(
        version: u64,
        expires: DateTime<Utc>,
        snapshot_version: u64,
        snapshot: &[u8],
    ) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert(
            Role::Snapshot.as_str().to_string(),
            MetaRef::describe(snapshot_version, snapshot),
        );
        Self {
            kind: Role::Timestamp,
            version,
            expires,
            meta,
        }
    }
}

/// Typed body of a parsed document.
#[derive(Clone, Debug)]
pub enum Document {
    Root(RootMeta),
    Targets(TargetsMeta),
    Snapshot(SnapshotMeta),
    Timestamp(TimestampMeta),
}

impl Document {
    /// Consistency references this document makes, as
    /// `(referenced role, reference)` pairs.
    pub fn references(&self) -> Vec<(Role, &MetaRef)> {
        let meta = match self {
            Document::Snapshot(s) => &s.meta,
            Document::Timestamp(t) => &t.meta,
            _ => return Vec::new(),
        };
        Role::ALL
            .iter()
            .filter_map(|role| meta.get(role.as_str()).map(|r| (*role, r)))
            .collect()
    }
}

/// A document decoded from submitted bytes.
#[derive(Clone, Debug)]
pub struct ParsedMetadata {
    pub role: Role,
    pub version: u64,
    /// Digest that signatures must cover.
    pub digest: Digest,
    pub signatures: Vec<Signature>,
    pub document: Document,
    /// Exactly the bytes that were submitted.
    pub bytes: Vec<u8>,
}

impl ParsedMetadata {
    /// Decode `bytes` as metadata for `role`.  Checks the envelope,
    /// the `_type` field, the version and the role specific shape
    /// (root key IDs, mandatory snapshot and timestamp entries).
    pub fn parse(role: Role, bytes: Vec<u8>) -> Result<Self, MetadataError> {
        let envelope: SignedEnvelope = serde_json::from_slice(&bytes)?;
        let digest = signing_digest(&envelope.signed)?;
        let document = match role {
            Role::Root => {
                let root: RootMeta = typed(&envelope.signed)?;
                root.check_key_ids()?;
                Document::Root(root)
            }
            Role::Targets => Document::Targets(typed(&envelope.signed)?),
            Role::Snapshot => {
                let snapshot: SnapshotMeta = typed(&envelope.signed)?;
                if !snapshot.meta.contains_key(Role::Targets.as_str()) {
                    return Err(MetadataError::MissingMeta(Role::Targets));
                }
                Document::Snapshot(snapshot)
            }
            Role::Timestamp => {
                let timestamp: TimestampMeta = typed(&envelope.signed)?;
                if !timestamp.meta.contains_key(Role::Snapshot.as_str()) {
                    return Err(MetadataError::MissingMeta(Role::Snapshot));
                }
                Document::Timestamp(timestamp)
            }
        };
        let (kind, version) = match &document {
            Document::Root(m) => (m.kind, m.version),
            Document::Targets(m) => (m.kind, m.version),
            Document::Snapshot(m) => (m.kind, m.version),
            Document::Timestamp(m) => (m.kind, m.version),
        };
        if kind != role {
            return Err(MetadataError::WrongType {
                expected: role,
                found: kind,
            });
        }
        if version == 0 {
            return Err(MetadataError::ZeroVersion);
        }
        Ok(Self {
            role,
            version,
            digest,
            signatures: envelope.signatures,
            document,
            bytes,
        })
    }

    pub fn as_root(&self) -> Option<&RootMeta> {
        match &self.document {
            Document::Root(root) => Some(root),
            _ => None,
        }
    }
}

fn typed<T: DeserializeOwned>(signed: &serde_json::Value) -> Result<T, MetadataError> {
    Ok(serde_json::from_value(signed.clone())?)
}
