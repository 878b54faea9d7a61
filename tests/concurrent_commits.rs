//! Racing writers on one collection: exactly one wins each version.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::join_all;

use common::*;
use notary::config::UpdatePolicy;
use notary::coordinator::UpdateCoordinator;
use notary::error::{StoreError, UpdateError};
use notary::signer::LocalSigner;
use notary::storage::{MemoryStore, MetaUpdate, MetadataStore, SqliteStore, StoredMeta};
use notary::tuf::{KeyRecord, Role};

const GUN: &str = "example.com/racy";

async fn race_store(store: Arc<dyn MetadataStore>) {
    store
        .commit_bundle(GUN, &[MetaUpdate::new(Role::Targets, 1, b"t1".to_vec())], None)
        .await
        .unwrap();

    let writers = (0..16).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .commit_bundle(
                    GUN,
                    &[
                        MetaUpdate::new(Role::Targets, 2, format!("t2 from {i}").into_bytes()),
                        MetaUpdate::new(Role::Snapshot, 1, format!("s1 from {i}").into_bytes()),
                    ],
                    None,
                )
                .await
        })
    });
    let results: Vec<_> = join_all(writers).await.into_iter().map(|r| r.unwrap()).collect();

    let winners: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_ok())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    for r in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(r, Err(StoreError::VersionConflict { .. })), "{r:?}");
    }

    // Both roles come from the same winner.
    let winner = winners[0];
    let targets = store.get_current(GUN, Role::Targets).await.unwrap();
    let snapshot = store.get_current(GUN, Role::Snapshot).await.unwrap();
    assert_eq!(targets.data, format!("t2 from {winner}").into_bytes());
    assert_eq!(snapshot.data, format!("s1 from {winner}").into_bytes());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_serialises_racing_bundles() {
    race_store(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_serialises_racing_bundles() {
    let dir = tempfile::tempdir().unwrap();
    race_store(Arc::new(SqliteStore::open(dir.path().join("race.db")).unwrap())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_clients_publishing_the_same_next_version() {
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(UpdateCoordinator::new(
        store.clone(),
        Arc::new(LocalSigner::new()),
        UpdatePolicy::default(),
    ));
    let repo = Arc::new(Repo::new());
    coordinator.publish(GUN, repo.bootstrap()).await.unwrap();

    let publish = |marker: u64| {
        let coordinator = coordinator.clone();
        let repo = repo.clone();
        tokio::spawn(async move {
            let mut doc = targets_doc(2);
            doc["targets"]["marker.txt"] = serde_json::json!({ "length": marker, "hashes": {} });
            let targets = envelope(&doc, &[&repo.targets]);
            coordinator.publish(GUN, vec![entry(Role::Targets, &targets)]).await
        })
    };
    let (a, b) = tokio::join!(publish(1), publish(2));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1, "{outcomes:?}");
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(UpdateError::Store(StoreError::VersionConflict { .. })))));
    assert_eq!(store.get_current(GUN, Role::Targets).await.unwrap().version, 2);
}

/// Writers abandoned mid-flight leave the collection either untouched
/// or fully advanced by one of them.
async fn abandon_store(store: Arc<dyn MetadataStore>) {
    store
        .commit_bundle(GUN, &[MetaUpdate::new(Role::Targets, 1, b"t1".to_vec())], None)
        .await
        .unwrap();

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .commit_bundle(
                        GUN,
                        &[
                            MetaUpdate::new(Role::Targets, 2, format!("t2 from {i}").into_bytes()),
                            MetaUpdate::new(Role::Snapshot, 1, format!("s1 from {i}").into_bytes()),
                        ],
                        None,
                    )
                    .await
            })
        })
        .collect();
    tokio::task::yield_now().await;
    for writer in &writers {
        writer.abort();
    }
    let finished: Vec<Option<usize>> = join_all(writers)
        .await
        .into_iter()
        .enumerate()
        .map(|(i, joined)| match joined {
            Ok(Ok(())) => Some(i),
            Ok(Err(_)) => None,
            Err(e) => {
                assert!(e.is_cancelled(), "{e:?}");
                None
            }
        })
        .collect();

    // Waits out any writer still inside its transaction.
    store
        .commit_bundle("example.com/other", &[MetaUpdate::new(Role::Root, 1, b"r1".to_vec())], None)
        .await
        .unwrap();

    let targets = store.get_current(GUN, Role::Targets).await.unwrap();
    match store.get_current(GUN, Role::Snapshot).await {
        Ok(snapshot) => {
            assert_eq!(targets.version, 2);
            let from = String::from_utf8(snapshot.data).unwrap().replace("s1", "t2");
            assert_eq!(targets.data, from.into_bytes());
        }
        Err(StoreError::NotFound { .. }) => {
            assert_eq!(targets, StoredMeta::new(1, b"t1".to_vec()));
            assert!(finished.iter().all(Option::is_none), "{finished:?}");
        }
        Err(e) => panic!("{e:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_abandoned_bundles_are_all_or_nothing() {
    abandon_store(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_abandoned_bundles_are_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    abandon_store(Arc::new(SqliteStore::open(dir.path().join("abandon.db")).unwrap())).await;
}

/// Store that lets a root rotation land between the coordinator
/// reading the root and committing its bundle.
struct RotatesFirst {
    inner: Arc<dyn MetadataStore>,
    rotation: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl MetadataStore for RotatesFirst {
    async fn get_current(&self, gun: &str, role: Role) -> Result<StoredMeta, StoreError> {
        self.inner.get_current(gun, role).await
    }

    async fn get_version(&self, gun: &str, role: Role, version: u64) -> Result<StoredMeta, StoreError> {
        self.inner.get_version(gun, role, version).await
    }

    async fn commit_bundle(
        &self,
        gun: &str,
        updates: &[MetaUpdate],
        verified_root: Option<u64>,
    ) -> Result<(), StoreError> {
        let rotation = self.rotation.lock().unwrap().take();
        if let Some(root) = rotation {
            self.inner
                .commit_bundle(gun, &[MetaUpdate::new(Role::Root, 2, root)], None)
                .await?;
        }
        self.inner.commit_bundle(gun, updates, verified_root).await
    }

    async fn get_key(&self, gun: &str, role: Role) -> Result<Option<KeyRecord>, StoreError> {
        self.inner.get_key(gun, role).await
    }

    async fn set_key_if_absent(&self, gun: &str, role: Role, key: KeyRecord) -> Result<KeyRecord, StoreError> {
        self.inner.set_key_if_absent(gun, role, key).await
    }
}

async fn revoked_key_loses_to_rotation(inner: Arc<dyn MetadataStore>) {
    let repo = Repo::new();
    UpdateCoordinator::new(inner.clone(), Arc::new(LocalSigner::new()), UpdatePolicy::default())
        .publish(GUN, repo.bootstrap())
        .await
        .unwrap();

    // Root v2 revokes the targets key the next bundle is signed with.
    let replacement = key();
    let root_v2 = root_doc(
        2,
        &[
            (Role::Root, vec![public(&repo.root)], 1),
            (Role::Targets, vec![public(&replacement)], 1),
            (Role::Snapshot, vec![public(&repo.snapshot)], 1),
            (Role::Timestamp, vec![public(&repo.timestamp)], 1),
        ],
    );
    let store: Arc<dyn MetadataStore> = Arc::new(RotatesFirst {
        inner: inner.clone(),
        rotation: Mutex::new(Some(envelope(&root_v2, &[&repo.root]))),
    });
    let coordinator = UpdateCoordinator::new(store, Arc::new(LocalSigner::new()), UpdatePolicy::default());

    let err = coordinator
        .publish(GUN, vec![entry(Role::Targets, &repo.targets(2))])
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            UpdateError::Store(StoreError::VersionConflict { role: Role::Root, expected: 2, declared: 1, .. })
        ),
        "{err:?}"
    );
    assert_eq!(inner.get_current(GUN, Role::Root).await.unwrap().version, 2);
    assert_eq!(inner.get_current(GUN, Role::Targets).await.unwrap().version, 1);

    // Against the new root the old key no longer verifies at all.
    let err = coordinator
        .publish(GUN, vec![entry(Role::Targets, &repo.targets(2))])
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::SignatureThresholdNotMet { .. }), "{err:?}");
}

#[tokio::test]
async fn memory_store_rejects_bundles_verified_against_a_replaced_root() {
    revoked_key_loses_to_rotation(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn sqlite_store_rejects_bundles_verified_against_a_replaced_root() {
    let dir = tempfile::tempdir().unwrap();
    revoked_key_loses_to_rotation(Arc::new(SqliteStore::open(dir.path().join("rotation.db")).unwrap())).await;
}
