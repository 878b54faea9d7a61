//! In-memory metadata store.
//!
//! Each collection owns an append-only list of versions per role,
//! indexed by `version - 1`.  Collections sit behind their own lock
//! so that a writer on one collection never waits for a writer on
//! another; the outer map lock is only taken to look a collection up
//! or to create it.  Nothing is persisted: restarting the process
//! forgets every collection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_versions, MetaUpdate, MetadataStore, StoredMeta};
use crate::error::StoreError;
use crate::tuf::{KeyRecord, Role};

#[derive(Debug, Default)]
struct Collection {
    history: HashMap<Role, Vec<StoredMeta>>,
    keys: HashMap<Role, KeyRecord>,
}

impl Collection {
    fn current_version(&self, role: Role) -> u64 {
        self.history.get(&role).map_or(0, |h| h.len() as u64)
    }
}

/// Ephemeral [`MetadataStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collection(&self, gun: &str) -> Option<Arc<RwLock<Collection>>> {
        self.collections.read().await.get(gun).cloned()
    }

    async fn collection_or_create(&self, gun: &str) -> Arc<RwLock<Collection>> {
        if let Some(existing) = self.collection(gun).await {
            return existing;
        }
        self.collections
            .write()
            .await
            .entry(gun.to_string())
            .or_default()
            .clone()
    }
}

fn not_found(gun: &str, role: Role, version: Option<u64>) -> StoreError {
    StoreError::NotFound {
        gun: gun.to_string(),
        role,
        version,
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_current(&self, gun: &str, role: Role) -> Result<StoredMeta, StoreError> {
        let collection = self.collection(gun).await.ok_or_else(|| not_found(gun, role, None))?;
        let collection = collection.read().await;
        collection
            .history
            .get(&role)
            .and_then(|h| h.last())
            .cloned()
            .ok_or_else(|| not_found(gun, role, None))
    }

    async fn get_version(&self, gun: &str, role: Role, version: u64) -> Result<StoredMeta, StoreError> {
        let missing = || not_found(gun, role, Some(version));
        let collection = self.collection(gun).await.ok_or_else(missing)?;
        let collection = collection.read().await;
        let index = usize::try_from(version).ok().and_then(|v| v.checked_sub(1)).ok_or_else(missing)?;
        collection
            .history
            .get(&role)
            .and_then(|h| h.get(index))
            .cloned()
            .ok_or_else(missing)
    }

    async fn commit_bundle(
        &self,
        gun: &str,
        updates: &[MetaUpdate],
        verified_root: Option<u64>,
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let collection = self.collection_or_create(gun).await;
        let mut collection = collection.write().await;
        // No await point from here on, so a caller dropping this
        // future cannot leave a half applied bundle.
        check_versions(gun, updates, verified_root, |role| Ok(collection.current_version(role)))?;
        for update in updates {
            collection
                .history
                .entry(update.role)
                .or_default()
                .push(StoredMeta::new(update.version, update.data.clone()));
        }
        Ok(())
    }

    async fn get_key(&self, gun: &str, role: Role) -> Result<Option<KeyRecord>, StoreError> {
        match self.collection(gun).await {
            Some(collection) => Ok(collection.read().await.keys.get(&role).cloned()),
            None => Ok(None),
        }
    }

    async fn set_key_if_absent(&self, gun: &str, role: Role, key: KeyRecord) -> Result<KeyRecord, StoreError> {
        let collection = self.collection_or_create(gun).await;
        let mut collection = collection.write().await;
        Ok(collection.keys.entry(role).or_insert(key).clone())
    }
}
