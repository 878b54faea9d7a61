//! The update coordinator.
//!
//! Every change to a collection goes through
//! [`UpdateCoordinator::publish`].  A bundle is a set of documents,
//! at most one per role, that must be accepted or rejected as a
//! whole.  Publishing runs these steps, each of which can reject the
//! bundle:
//!
//! 1. decode every entry as metadata for the role it is filed under;
//! 2. find the trusted root: the committed root, or for a new
//!    collection the root carried by the bundle itself;
//! 3. check root signatures according to the commit kind (bootstrap,
//!    ordinary update or root rotation) and the rotation policy;
//! 4. check every other role against the keys the trusted root
//!    authorises for it;
//! 5. optionally add a server-signed timestamp for a new snapshot;
//! 6. resolve every snapshot and timestamp consistency reference,
//!    first against the bundle, then against committed history;
//! 7. hand the bundle to the store, which enforces version
//!    succession atomically.
//!
//! Nothing is written before step 7, and step 7 writes all or
//! nothing, so a rejected bundle never leaves a trace.  No lock is
//! held while the trust service is signing.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{RootRotationPolicy, UpdatePolicy};
use crate::error::{StoreError, UpdateError};
use crate::security::{count_valid_signatures, verify};
use crate::signer::TrustService;
use crate::storage::{MetaUpdate, MetadataStore, StoredMeta};
use crate::tuf::canonical::signing_digest;
use crate::tuf::{AuthorizedKeys, KeyRecord, ParsedMetadata, Role, RootMeta, SignedEnvelope, TimestampMeta};

/// One submitted document, filed under a role name.  The name is
/// parsed by the coordinator so that unknown roles are reported as
/// such rather than failing earlier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleEntry {
    pub role: String,
    pub data: Vec<u8>,
}

impl BundleEntry {
    pub fn new(role: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            role: role.into(),
            data,
        }
    }
}

/// How a bundle relates to the collection's root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitKind {
    /// First bundle of a new collection; it carries the initial root.
    Bootstrap,
    /// The committed root stays in force.
    Ordinary,
    /// The bundle replaces the committed root.
    RootRotation,
}

/// A successfully committed bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Committed {
    pub kind: CommitKind,
    /// The version each role now has.  Includes a server-produced
    /// timestamp when one was added.
    pub versions: BTreeMap<Role, u64>,
}

type Bundle = BTreeMap<Role, ParsedMetadata>;

pub struct UpdateCoordinator {
    store: Arc<dyn MetadataStore>,
    trust: Arc<dyn TrustService>,
    policy: UpdatePolicy,
}

impl UpdateCoordinator {
    pub fn new(store: Arc<dyn MetadataStore>, trust: Arc<dyn TrustService>, policy: UpdatePolicy) -> Self {
        Self { store, trust, policy }
    }

    /// Validate and commit a bundle for collection `gun`.
    pub async fn publish(&self, gun: &str, entries: Vec<BundleEntry>) -> Result<Committed, UpdateError> {
        let outcome = self.try_publish(gun, entries).await;
        match &outcome {
            Ok(committed) => info!(gun, kind = ?committed.kind, versions = ?committed.versions, "committed bundle"),
            Err(e) => warn!(gun, error = %e, "rejected bundle"),
        }
        outcome
    }

    async fn try_publish(&self, gun: &str, entries: Vec<BundleEntry>) -> Result<Committed, UpdateError> {
        let mut bundle = decode_bundle(entries)?;
        let current_root = self.current_root(gun).await?;
        let verified_root = current_root.as_ref().map_or(0, |root| root.version);
        let (kind, trusted) = authorize_root(gun, current_root, bundle.get(&Role::Root), self.policy.root_rotation)?;

        for role in [Role::Targets, Role::Snapshot, Role::Timestamp] {
            if let Some(doc) = bundle.get(&role) {
                check_threshold(doc, &trusted.authorized_keys(role), "root-authorised keys")?;
            }
        }

        if let Some(timestamp) = self.auto_timestamp(gun, &bundle, &trusted).await? {
            check_threshold(&timestamp, &trusted.authorized_keys(Role::Timestamp), "server timestamp key")?;
            bundle.insert(Role::Timestamp, timestamp);
        }

        self.check_references(gun, &bundle).await?;

        let updates: Vec<MetaUpdate> = bundle
            .into_values()
            .map(|doc| MetaUpdate::new(doc.role, doc.version, doc.bytes))
            .collect();
        self.store.commit_bundle(gun, &updates, Some(verified_root)).await?;
        Ok(Committed {
            kind,
            versions: updates.iter().map(|u| (u.role, u.version)).collect(),
        })
    }

    /// The committed root, if the collection has one.
    async fn current_root(&self, gun: &str) -> Result<Option<RootMeta>, UpdateError> {
        let stored = match self.store.get_current(gun, Role::Root).await {
            Ok(stored) => stored,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parsed = ParsedMetadata::parse(Role::Root, stored.data).map_err(|e| UpdateError::malformed(Role::Root, e))?;
        Ok(parsed.as_root().cloned())
    }

    /// Current version of `role`, 0 if it has none.
    async fn current_version(&self, gun: &str, role: Role) -> Result<u64, UpdateError> {
        match self.store.get_current(gun, role).await {
            Ok(stored) => Ok(stored.version),
            Err(StoreError::NotFound { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_references(&self, gun: &str, bundle: &Bundle) -> Result<(), UpdateError> {
        for doc in bundle.values() {
            for (target, reference) in doc.document.references() {
                let reason = match bundle.get(&target) {
                    Some(entry) => reference.mismatch(entry.version, &entry.bytes),
                    None => match self.store.get_version(gun, target, reference.version).await {
                        Ok(stored) => reference.mismatch(stored.version, &stored.data),
                        Err(StoreError::NotFound { .. }) => Some("that version was never committed".to_string()),
                        Err(e) => return Err(e.into()),
                    },
                };
                if let Some(reason) = reason {
                    return Err(UpdateError::ConsistencyReferenceMismatch {
                        role: doc.role,
                        target,
                        version: reference.version,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// A server-signed timestamp for the bundle's snapshot, when the
    /// policy asks for one and the server holds a timestamp key that
    /// can meet the trusted root's timestamp threshold on its own.
    async fn auto_timestamp(
        &self,
        gun: &str,
        bundle: &Bundle,
        trusted: &RootMeta,
    ) -> Result<Option<ParsedMetadata>, UpdateError> {
        if !self.policy.auto_timestamp || bundle.contains_key(&Role::Timestamp) {
            return Ok(None);
        }
        let Some(snapshot) = bundle.get(&Role::Snapshot) else {
            return Ok(None);
        };
        let Some(key) = self.store.get_key(gun, Role::Timestamp).await? else {
            return Ok(None);
        };
        let authorized = trusted.authorized_keys(Role::Timestamp);
        if authorized.threshold != 1 || !authorized.keys.contains_key(&key.id) {
            debug!(gun, key_id = %key.id, "server timestamp key cannot sign alone; leaving bundle as is");
            return Ok(None);
        }
        let version = self.current_version(gun, Role::Timestamp).await? + 1;
        let bytes = self.sign_timestamp(&key, version, snapshot.version, &snapshot.bytes).await?;
        debug!(gun, version, snapshot = snapshot.version, "added server timestamp");
        ParsedMetadata::parse(Role::Timestamp, bytes)
            .map(Some)
            .map_err(|e| UpdateError::malformed(Role::Timestamp, e))
    }

    /// Build and sign timestamp `version` pointing at the given
    /// snapshot bytes.
    async fn sign_timestamp(
        &self,
        key: &KeyRecord,
        version: u64,
        snapshot_version: u64,
        snapshot: &[u8],
    ) -> Result<Vec<u8>, UpdateError> {
        let expires = Utc::now() + chrono::Duration::seconds(i64::from(self.policy.timestamp_validity_secs));
        let signed = TimestampMeta::for_snapshot(version, expires, snapshot_version, snapshot);
        let digest = signing_digest(&signed).map_err(|e| UpdateError::malformed(Role::Timestamp, e))?;
        let signature = self.trust.sign(&key.id, &digest).await?;
        let envelope = SignedEnvelope {
            signed,
            signatures: vec![signature],
        };
        serde_json::to_vec(&envelope).map_err(|e| UpdateError::malformed(Role::Timestamp, e))
    }

    /// The collection's server-held timestamp key, created through
    /// the trust service on first use.
    pub async fn timestamp_key(&self, gun: &str) -> Result<KeyRecord, UpdateError> {
        if let Some(key) = self.store.get_key(gun, Role::Timestamp).await? {
            return Ok(key);
        }
        let generated = self.trust.generate_key(Role::Timestamp).await?;
        let recorded = self.store.set_key_if_absent(gun, Role::Timestamp, generated).await?;
        info!(gun, key_id = %recorded.id, "timestamp key ready");
        Ok(recorded)
    }

    /// Sign and commit a new timestamp over the current snapshot.
    /// The timestamp goes through [`publish`](Self::publish) like any
    /// client bundle, so it must verify against the committed root.
    pub async fn refresh_timestamp(&self, gun: &str) -> Result<Committed, UpdateError> {
        let snapshot: StoredMeta = self.store.get_current(gun, Role::Snapshot).await?;
        let key = self.timestamp_key(gun).await?;
        let version = self.current_version(gun, Role::Timestamp).await? + 1;
        let bytes = match self.sign_timestamp(&key, version, snapshot.version, &snapshot.data).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(gun, error = %e, "could not sign timestamp");
                return Err(e);
            }
        };
        self.publish(gun, vec![BundleEntry::new(Role::Timestamp.as_str(), bytes)]).await
    }
}

/// Parse role names and documents.  Rejects empty bundles and roles
/// listed twice.
fn decode_bundle(entries: Vec<BundleEntry>) -> Result<Bundle, UpdateError> {
    if entries.is_empty() {
        return Err(UpdateError::InvalidBundle("bundle is empty".into()));
    }
    let mut bundle = Bundle::new();
    for entry in entries {
        let role: Role = entry
            .role
            .parse()
            .map_err(|_| UpdateError::UnknownRole(entry.role.clone()))?;
        if bundle.contains_key(&role) {
            return Err(UpdateError::InvalidBundle(format!("{role} listed twice")));
        }
        let doc = ParsedMetadata::parse(role, entry.data).map_err(|e| UpdateError::malformed(role, e))?;
        bundle.insert(role, doc);
    }
    Ok(bundle)
}

/// Decide the commit kind and which root the other roles are
/// checked against, verifying any root in the bundle on the way.
fn authorize_root(
    gun: &str,
    current: Option<RootMeta>,
    incoming: Option<&ParsedMetadata>,
    policy: RootRotationPolicy,
) -> Result<(CommitKind, RootMeta), UpdateError> {
    let incoming = match incoming {
        Some(doc) => {
            let root = doc
                .as_root()
                .ok_or_else(|| UpdateError::InvalidBundle("root entry is not root metadata".into()))?;
            check_root_role_satisfiable(root)?;
            Some((doc, root))
        }
        None => None,
    };
    match (current, incoming) {
        (None, None) => Err(UpdateError::NoTrustedRoot(gun.to_string())),
        (None, Some((doc, root))) => {
            check_threshold(doc, &root.authorized_keys(Role::Root), "root's own keys")?;
            Ok((CommitKind::Bootstrap, root.clone()))
        }
        (Some(current), None) => Ok((CommitKind::Ordinary, current)),
        (Some(current), Some((doc, root))) => {
            check_threshold(doc, &current.authorized_keys(Role::Root), "previous root keys")?;
            if policy == RootRotationPolicy::DualThreshold {
                check_threshold(doc, &root.authorized_keys(Role::Root), "new root keys")?;
            }
            Ok((CommitKind::RootRotation, current))
        }
    }
}

/// A root whose own role can never be signed for would leave the
/// collection with no way to rotate again.
fn check_root_role_satisfiable(root: &RootMeta) -> Result<(), UpdateError> {
    let own = root.authorized_keys(Role::Root);
    if own.threshold == 0 || own.threshold as usize > own.keys.len() {
        return Err(UpdateError::InvalidBundle(format!(
            "root role needs {} signatures from {} known keys",
            own.threshold,
            own.keys.len()
        )));
    }
    Ok(())
}

fn check_threshold(doc: &ParsedMetadata, authorized: &AuthorizedKeys, keys: &'static str) -> Result<(), UpdateError> {
    if verify(&doc.digest, &doc.signatures, authorized) {
        return Ok(());
    }
    Err(UpdateError::SignatureThresholdNotMet {
        role: doc.role,
        valid: count_valid_signatures(&doc.digest, &doc.signatures, authorized),
        threshold: authorized.threshold,
        keys,
    })
}
