//! Server wiring.
//!
//! A [`NotaryServer`] owns the store, the trust service and the
//! update coordinator built on them.  It is what the frontend talks
//! to and what the `notary-server` binary constructs from its
//! configuration.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::{Config, UpdatePolicy};
use crate::coordinator::{BundleEntry, Committed, UpdateCoordinator};
use crate::error::{StoreError, UpdateError};
use crate::signer::{self, TrustService};
use crate::storage::{self, MetadataStore, StoredMeta};
use crate::tuf::{KeyRecord, Role};

pub struct NotaryServer {
    store: Arc<dyn MetadataStore>,
    coordinator: UpdateCoordinator,
}

impl NotaryServer {
    pub fn new(store: Arc<dyn MetadataStore>, trust: Arc<dyn TrustService>, policy: UpdatePolicy) -> Self {
        Self {
            coordinator: UpdateCoordinator::new(store.clone(), trust, policy),
            store,
        }
    }

    /// Open the configured store and trust service.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = storage::open(&config.store)?;
        let trust = signer::from_config(&config.trust_service).await?;
        info!(store = ?config.store, trust_service = ?config.trust_service, "notary server ready");
        Ok(Self::new(store, trust, config.update.clone()))
    }

    pub async fn publish(&self, gun: &str, entries: Vec<BundleEntry>) -> Result<Committed, UpdateError> {
        self.coordinator.publish(gun, entries).await
    }

    pub async fn get_current(&self, gun: &str, role: Role) -> Result<StoredMeta, StoreError> {
        self.store.get_current(gun, role).await
    }

    pub async fn get_version(&self, gun: &str, role: Role, version: u64) -> Result<StoredMeta, StoreError> {
        self.store.get_version(gun, role, version).await
    }

    pub async fn timestamp_key(&self, gun: &str) -> Result<KeyRecord, UpdateError> {
        self.coordinator.timestamp_key(gun).await
    }

    pub async fn refresh_timestamp(&self, gun: &str) -> Result<Committed, UpdateError> {
        self.coordinator.refresh_timestamp(gun).await
    }
}
