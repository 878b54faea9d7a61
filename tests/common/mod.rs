//! Shared fixtures: metadata builders, signing and TLS material.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DnType, KeyPair};
use serde_json::{json, Value};

use notary::config::UpdatePolicy;
use notary::coordinator::{BundleEntry, UpdateCoordinator};
use notary::signer::{LocalSigner, TrustService};
use notary::storage::{MemoryStore, MetadataStore};
use notary::tuf::canonical::signing_digest;
use notary::tuf::{KeyId, MetaRef, PublicKey, Role, Signature};

pub const EXPIRES: &str = "2030-01-01T00:00:00Z";

pub fn key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn public(key: &SigningKey) -> PublicKey {
    PublicKey::from_ed25519(&key.verifying_key())
}

pub fn key_id(key: &SigningKey) -> KeyId {
    public(key).key_id()
}

/// Root `signed` body.  Each entry lists the public keys and
/// threshold for one role.
pub fn root_doc(version: u64, roles: &[(Role, Vec<PublicKey>, u32)]) -> Value {
    let mut keys = serde_json::Map::new();
    let mut role_map = serde_json::Map::new();
    for (role, publics, threshold) in roles {
        let ids: Vec<String> = publics.iter().map(|p| p.key_id().0).collect();
        for p in publics {
            keys.insert(p.key_id().0, serde_json::to_value(p).unwrap());
        }
        role_map.insert(role.as_str().into(), json!({ "keyids": ids, "threshold": threshold }));
    }
    json!({
        "_type": "root",
        "version": version,
        "expires": EXPIRES,
        "keys": keys,
        "roles": role_map,
        "consistent_snapshot": false,
    })
}

pub fn targets_doc(version: u64) -> Value {
    json!({
        "_type": "targets",
        "version": version,
        "expires": EXPIRES,
        "targets": {
            "app.tar.gz": {
                "length": 1024 * version,
                "hashes": { "sha256": format!("{version:064x}") }
            }
        }
    })
}

fn reference(version: u64, bytes: &[u8]) -> Value {
    serde_json::to_value(MetaRef::describe(version, bytes)).unwrap()
}

pub fn snapshot_doc(version: u64, targets: (u64, &[u8])) -> Value {
    json!({
        "_type": "snapshot",
        "version": version,
        "expires": EXPIRES,
        "meta": { "targets": reference(targets.0, targets.1) }
    })
}

pub fn timestamp_doc(version: u64, snapshot: (u64, &[u8])) -> Value {
    json!({
        "_type": "timestamp",
        "version": version,
        "expires": EXPIRES,
        "meta": { "snapshot": reference(snapshot.0, snapshot.1) }
    })
}

/// Wrap `signed` in an envelope signed by each of `signers`.
pub fn envelope(signed: &Value, signers: &[&SigningKey]) -> Vec<u8> {
    let digest = signing_digest(signed).unwrap();
    let signatures: Vec<Signature> = signers
        .iter()
        .map(|k| Signature::from_ed25519(key_id(k), &k.sign(&digest)))
        .collect();
    serde_json::to_vec(&json!({ "signed": signed, "signatures": signatures })).unwrap()
}

pub fn entry(role: Role, data: &[u8]) -> BundleEntry {
    BundleEntry::new(role.as_str(), data.to_vec())
}

/// One key per role, threshold one everywhere.
pub struct Repo {
    pub root: SigningKey,
    pub targets: SigningKey,
    pub snapshot: SigningKey,
    pub timestamp: SigningKey,
}

impl Repo {
    pub fn new() -> Self {
        Self {
            root: key(),
            targets: key(),
            snapshot: key(),
            timestamp: key(),
        }
    }

    /// Root listing `timestamp` as the timestamp key.
    pub fn root_with_timestamp_key(&self, version: u64, timestamp: PublicKey) -> Vec<u8> {
        let doc = root_doc(
            version,
            &[
                (Role::Root, vec![public(&self.root)], 1),
                (Role::Targets, vec![public(&self.targets)], 1),
                (Role::Snapshot, vec![public(&self.snapshot)], 1),
                (Role::Timestamp, vec![timestamp], 1),
            ],
        );
        envelope(&doc, &[&self.root])
    }

    pub fn root(&self, version: u64) -> Vec<u8> {
        self.root_with_timestamp_key(version, public(&self.timestamp))
    }

    pub fn targets(&self, version: u64) -> Vec<u8> {
        envelope(&targets_doc(version), &[&self.targets])
    }

    pub fn snapshot(&self, version: u64, targets: (u64, &[u8])) -> Vec<u8> {
        envelope(&snapshot_doc(version, targets), &[&self.snapshot])
    }

    pub fn timestamp(&self, version: u64, snapshot: (u64, &[u8])) -> Vec<u8> {
        envelope(&timestamp_doc(version, snapshot), &[&self.timestamp])
    }

    /// Root, targets and snapshot at version one.
    pub fn bootstrap(&self) -> Vec<BundleEntry> {
        let targets = self.targets(1);
        vec![
            entry(Role::Root, &self.root(1)),
            entry(Role::Snapshot, &self.snapshot(1, (1, &targets))),
            entry(Role::Targets, &targets),
        ]
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub signer: Arc<LocalSigner>,
    pub coordinator: UpdateCoordinator,
}

pub fn harness(policy: UpdatePolicy) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let signer = Arc::new(LocalSigner::new());
    let coordinator = UpdateCoordinator::new(
        store.clone() as Arc<dyn MetadataStore>,
        signer.clone() as Arc<dyn TrustService>,
        policy,
    );
    Harness {
        store,
        signer,
        coordinator,
    }
}

/// Throwaway PKI written to a temporary directory.
pub struct Pki {
    pub dir: tempfile::TempDir,
    pub ca_cert: PathBuf,
    pub signer_cert: PathBuf,
    pub signer_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

fn write(dir: &Path, name: &str, contents: String) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

impl Pki {
    /// A CA, a `localhost` certificate for the signing service and a
    /// client certificate for the notary server, all issued by it.
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name.push(DnType::CommonName, "Notary Test CA");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf = |name: &str| {
            let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
            params.distinguished_name.push(DnType::CommonName, name);
            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &ca, &ca_key).unwrap();
            (cert.pem(), key.serialize_pem())
        };
        let (signer_cert, signer_key) = leaf("localhost");
        let (client_cert, client_key) = leaf("notary-server");

        let root = dir.path().to_path_buf();
        Self {
            ca_cert: write(&root, "ca.crt", ca.pem()),
            signer_cert: write(&root, "signer.crt", signer_cert),
            signer_key: write(&root, "signer.key", signer_key),
            client_cert: write(&root, "client.crt", client_cert),
            client_key: write(&root, "client.key", client_key),
            dir,
        }
    }
}
