//! Versioned metadata storage.
//!
//! A store keeps, for every collection (identified by its GUN) and
//! every role, an append-only history of metadata versions.  The
//! store is deliberately ignorant of signatures and references: its
//! only job is to make sure each role advances by exactly one
//! version at a time and that a multi-role bundle lands all at once
//! or not at all.  That compare-and-append is the server's only
//! concurrency control, so both backends implement it under a
//! per-collection critical section.
//!
//! Two backends exist behind the [`MetadataStore`] trait:
//!
//! * [`MemoryStore`](memory::MemoryStore) for tests and throwaway
//!   deployments;
//! * [`SqliteStore`](sqlite::SqliteStore) for durable deployments.
//!
//! Which one is used is decided once at start-up by [`open`].

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::tuf::canonical::sha256_hex;
use crate::tuf::{KeyRecord, Role};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A committed version of one role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMeta {
    pub version: u64,
    /// Exactly the bytes that were committed.
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`.
    pub sha256: String,
}

impl StoredMeta {
    pub fn new(version: u64, data: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&data);
        Self {
            version,
            data,
            sha256,
        }
    }
}

/// One role's entry in a bundle handed to
/// [`commit_bundle`](MetadataStore::commit_bundle).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaUpdate {
    pub role: Role,
    /// Version the writer claims this document has.  Must be exactly
    /// one past the role's current version.
    pub version: u64,
    pub data: Vec<u8>,
}

impl MetaUpdate {
    pub fn new(role: Role, version: u64, data: Vec<u8>) -> Self {
        Self {
            role,
            version,
            data,
        }
    }
}

/// Storage contract shared by all backends.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Highest committed version of `role` in `gun`.
    async fn get_current(&self, gun: &str, role: Role) -> Result<StoredMeta, StoreError>;

    /// An exact historical version.
    async fn get_version(&self, gun: &str, role: Role, version: u64) -> Result<StoredMeta, StoreError>;

    /// Append one version per update, all or nothing.  Fails with
    /// [`StoreError::VersionConflict`] if any declared version is not
    /// exactly the role's current version plus one (or one for a
    /// role with no history), if the bundle names a role twice, or
    /// if `verified_root` is given and the collection's current root
    /// version (0 for none) differs from it.  The last check runs
    /// under the same lock as the append, so a bundle verified
    /// against one root can never land on top of another.
    async fn commit_bundle(
        &self,
        gun: &str,
        updates: &[MetaUpdate],
        verified_root: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Server-held key recorded for `role` in `gun`, if any.
    async fn get_key(&self, gun: &str, role: Role) -> Result<Option<KeyRecord>, StoreError>;

    /// Record `key` unless a key is already recorded for `role` in
    /// `gun`.  Returns whichever record is stored afterwards, so
    /// racing callers converge on one key.
    async fn set_key_if_absent(&self, gun: &str, role: Role, key: KeyRecord) -> Result<KeyRecord, StoreError>;
}

/// Check a bundle against the current versions of its roles and,
/// when given, the root version it was verified against.  Shared by
/// both backends so that they agree on what a conflict is.
pub(crate) fn check_versions<F>(
    gun: &str,
    updates: &[MetaUpdate],
    verified_root: Option<u64>,
    mut current: F,
) -> Result<(), StoreError>
where
    F: FnMut(Role) -> Result<u64, StoreError>,
{
    if let Some(verified) = verified_root {
        let root_now = current(Role::Root)?;
        if root_now != verified {
            return Err(StoreError::VersionConflict {
                gun: gun.to_string(),
                role: Role::Root,
                expected: root_now,
                declared: verified,
            });
        }
    }
    let mut seen = Vec::with_capacity(updates.len());
    for update in updates {
        let expected = current(update.role)? + 1;
        if update.version != expected || seen.contains(&update.role) {
            return Err(StoreError::VersionConflict {
                gun: gun.to_string(),
                role: update.role,
                expected,
                declared: update.version,
            });
        }
        seen.push(update.role);
    }
    Ok(())
}

/// Open the backend selected in the configuration.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn MetadataStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Sqlite { db_path } => Ok(Arc::new(SqliteStore::open(db_path)?)),
    }
}
