//! `SQLite` backed metadata store.
//!
//! All statements run on blocking threads.  Writes go through one
//! writer connection; reads of a file database use a small set of
//! read-only connections, which WAL mode lets proceed while a write
//! transaction is open.  A bundle commit is one `BEGIN IMMEDIATE`
//! transaction that reads the current version of every role in the
//! bundle (and the root version the bundle was verified against),
//! checks them and inserts all rows; the immediate lock serialises
//! writers across processes sharing the database file, and the
//! `(gun, role, version)` primary key turns any writer that slips
//! past the check into a version conflict instead of a duplicate.
//!
//! A commit whose caller goes away before the transaction commits
//! is rolled back, so an abandoned bundle is either applied in full
//! (the caller left after the commit point) or not at all.

// SQLite stores versions as i64; versions are always >= 1 and come
// from a checked `current + 1`, so the casts cannot lose information.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};

use super::{check_versions, MetaUpdate, MetadataStore, StoredMeta};
use crate::error::StoreError;
use crate::tuf::{KeyId, KeyRecord, PublicKey, Role};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a statement waits on a lock held by another connection
/// before giving up with `BackendUnavailable`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only connections opened next to the writer.
const READERS: usize = 4;

/// Durable [`MetadataStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    writer: Arc<Mutex<Connection>>,
    /// Empty for a private in-memory database, which other
    /// connections cannot see; reads then go through the writer.
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

/// Raises its flag when dropped, i.e. when the future owning it
/// completes or is abandoned.
struct RaiseOnDrop(Arc<AtomicBool>);

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::BackendUnavailable(e.to_string())
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::BackendUnavailable("connection lock poisoned".into()))
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::BackendUnavailable(format!("storage task failed: {e}")))?
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn current_version(conn: &Connection, gun: &str, role: Role) -> Result<u64, StoreError> {
    let max: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM tuf_files WHERE gun = ?1 AND role = ?2",
            params![gun, role.as_str()],
            |row| row.get(0),
        )
        .map_err(backend)?;
    Ok(max.unwrap_or(0) as u64)
}

fn read_key(conn: &Connection, gun: &str, role: Role) -> Result<Option<KeyRecord>, StoreError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT keyid, public FROM server_keys WHERE gun = ?1 AND role = ?2",
            params![gun, role.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(backend)?;
    let Some((keyid, public)) = row else {
        return Ok(None);
    };
    let public: PublicKey = serde_json::from_str(&public)
        .map_err(|e| StoreError::BackendUnavailable(format!("corrupt key record for {gun}/{role}: {e}")))?;
    Ok(Some(KeyRecord {
        id: KeyId(keyid),
        role,
        public,
    }))
}

fn init_writer(conn: Connection) -> Result<Connection, StoreError> {
    conn.busy_timeout(BUSY_TIMEOUT).map_err(backend)?;
    conn.execute_batch(SCHEMA_SQL).map_err(backend)?;
    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(backend)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(backend)?;
    Ok(conn)
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let writer = Connection::open(path).map_err(backend)?;
        writer.execute_batch("PRAGMA journal_mode = WAL;").map_err(backend)?;
        let writer = init_writer(writer)?;
        let readers = (0..READERS)
            .map(|_| open_reader(path).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::assemble(writer, readers))
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let writer = init_writer(Connection::open_in_memory().map_err(backend)?)?;
        Ok(Self::assemble(writer, Vec::new()))
    }

    fn assemble(writer: Connection, readers: Vec<Mutex<Connection>>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `f` with the writer connection on the blocking pool.
    async fn with_writer<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let writer = self.writer.clone();
        blocking(move || f(&mut *lock(&writer)?)).await
    }

    /// Run `f` with the next read connection on the blocking pool.
    async fn with_reader<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        if self.readers.is_empty() {
            return self.with_writer(move |conn| f(conn)).await;
        }
        let readers = self.readers.clone();
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        blocking(move || f(&*lock(&readers[slot])?)).await
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn get_current(&self, gun: &str, role: Role) -> Result<StoredMeta, StoreError> {
        let gun = gun.to_string();
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT version, data, sha256 FROM tuf_files
                 WHERE gun = ?1 AND role = ?2
                 ORDER BY version DESC LIMIT 1",
                params![gun, role.as_str()],
                |row| {
                    Ok(StoredMeta {
                        version: row.get::<_, i64>(0)? as u64,
                        data: row.get(1)?,
                        sha256: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::NotFound {
                gun,
                role,
                version: None,
            })
        })
        .await
    }

    async fn get_version(&self, gun: &str, role: Role, version: u64) -> Result<StoredMeta, StoreError> {
        let gun = gun.to_string();
        self.with_reader(move |conn| {
            let Ok(wanted) = i64::try_from(version) else {
                return Err(StoreError::NotFound {
                    gun,
                    role,
                    version: Some(version),
                });
            };
            conn.query_row(
                "SELECT data, sha256 FROM tuf_files WHERE gun = ?1 AND role = ?2 AND version = ?3",
                params![gun, role.as_str(), wanted],
                |row| {
                    Ok(StoredMeta {
                        version,
                        data: row.get(0)?,
                        sha256: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::NotFound {
                gun,
                role,
                version: Some(version),
            })
        })
        .await
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
        let gun = gun.to_string();
        let updates = updates.to_vec();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _abandon_on_drop = RaiseOnDrop(abandoned.clone());
        self.with_writer(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(backend)?;
            check_versions(&gun, &updates, verified_root, |role| current_version(&tx, &gun, role))?;
            let created_at = Utc::now().to_rfc3339();
            {
                let mut insert = tx
                    .prepare(
                        "INSERT INTO tuf_files (gun, role, version, data, sha256, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .map_err(backend)?;
                for update in &updates {
                    let stored = StoredMeta::new(update.version, update.data.clone());
                    insert
                        .execute(params![
                            gun,
                            update.role.as_str(),
                            update.version as i64,
                            stored.data,
                            stored.sha256,
                            created_at,
                        ])
                        .map_err(|e| {
                            if is_constraint_violation(&e) {
                                StoreError::VersionConflict {
                                    gun: gun.clone(),
                                    role: update.role,
                                    expected: update.version + 1,
                                    declared: update.version,
                                }
                            } else {
                                backend(e)
                            }
                        })?;
                }
            }
            // Dropping `tx` on any early return rolls back.
            if abandoned.load(Ordering::SeqCst) {
                return Err(StoreError::BackendUnavailable(format!("commit to {gun} abandoned by caller")));
            }
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn get_key(&self, gun: &str, role: Role) -> Result<Option<KeyRecord>, StoreError> {
        let gun = gun.to_string();
        self.with_reader(move |conn| read_key(conn, &gun, role)).await
    }

    async fn set_key_if_absent(&self, gun: &str, role: Role, key: KeyRecord) -> Result<KeyRecord, StoreError> {
        let gun = gun.to_string();
        self.with_writer(move |conn| {
            let public = serde_json::to_string(&key.public)
                .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(backend)?;
            tx.execute(
                "INSERT OR IGNORE INTO server_keys (gun, role, keyid, public) VALUES (?1, ?2, ?3, ?4)",
                params![gun, role.as_str(), key.id.as_str(), public],
            )
            .map_err(backend)?;
            let stored = read_key(&tx, &gun, role)?;
            tx.commit().map_err(backend)?;
            stored.ok_or_else(|| StoreError::BackendUnavailable(format!("key for {gun}/{role} vanished")))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(role: Role, version: u64, data: &[u8]) -> MetaUpdate {
        MetaUpdate::new(role, version, data.to_vec())
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notary.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .commit_bundle("gun", &[update(Role::Root, 1, b"r1"), update(Role::Targets, 1, b"t1")], None)
                .await
                .unwrap();
            store.commit_bundle("gun", &[update(Role::Targets, 2, b"t2")], None).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let current = store.get_current("gun", Role::Targets).await.unwrap();
        assert_eq!(current, StoredMeta::new(2, b"t2".to_vec()));
        assert_eq!(store.get_version("gun", Role::Targets, 1).await.unwrap().data, b"t1");
        assert_eq!(store.get_current("gun", Role::Root).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn rejected_bundle_writes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.commit_bundle("gun", &[update(Role::Targets, 1, b"t1")], None).await.unwrap();
        let err = store
            .commit_bundle("gun", &[update(Role::Snapshot, 1, b"s1"), update(Role::Targets, 3, b"t3")], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { role: Role::Targets, expected: 2, declared: 3, .. }
        ));
        assert!(matches!(
            store.get_current("gun", Role::Snapshot).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_versions_are_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.commit_bundle("gun", &[update(Role::Root, 1, b"r1")], None).await.unwrap();
        assert!(matches!(
            store.get_version("gun", Role::Root, 2).await,
            Err(StoreError::NotFound { version: Some(2), .. })
        ));
        assert!(matches!(
            store.get_version("gun", Role::Root, u64::MAX).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_current("other", Role::Root).await,
            Err(StoreError::NotFound { version: None, .. })
        ));
    }

    #[tokio::test]
    async fn key_records_round_trip_and_first_wins() {
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;

        let store = SqliteStore::open_in_memory().unwrap();
        let make = || {
            KeyRecord::new(
                Role::Timestamp,
                PublicKey::from_ed25519(&SigningKey::generate(&mut OsRng).verifying_key()),
            )
        };
        let first = make();
        let stored = store.set_key_if_absent("gun", Role::Timestamp, first.clone()).await.unwrap();
        assert_eq!(stored, first);
        let again = store.set_key_if_absent("gun", Role::Timestamp, make()).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(store.get_key("gun", Role::Timestamp).await.unwrap(), Some(first));
        assert_eq!(store.get_key("gun", Role::Snapshot).await.unwrap(), None);
    }

    #[test]
    fn unopenable_database_is_backend_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteStore::open(dir.path().join("missing").join("notary.db")).unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn bundle_verified_against_a_replaced_root_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.commit_bundle("gun", &[update(Role::Root, 1, b"r1")], Some(0)).await.unwrap();
        store.commit_bundle("gun", &[update(Role::Root, 2, b"r2")], Some(1)).await.unwrap();

        let err = store
            .commit_bundle("gun", &[update(Role::Targets, 1, b"t1")], Some(1))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::VersionConflict { role: Role::Root, expected: 2, declared: 1, .. }),
            "{err:?}"
        );
        assert!(store.get_current("gun", Role::Targets).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_commit_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notary.db");
        let store = SqliteStore::open(&path).unwrap();
        store.commit_bundle("gun", &[update(Role::Targets, 1, b"t1")], None).await.unwrap();

        // Another process holds the write lock, so the commit below
        // waits inside its transaction.
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();
        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.commit_bundle("gun", &[update(Role::Targets, 2, b"t2")], None).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Reads are not held up by the open write transactions.
        assert_eq!(store.get_current("gun", Role::Targets).await.unwrap().version, 1);

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        other.execute_batch("COMMIT").unwrap();

        // The writer finishes the abandoned transaction before this.
        store.commit_bundle("other", &[update(Role::Root, 1, b"r1")], None).await.unwrap();
        let targets = store.get_current("gun", Role::Targets).await.unwrap();
        assert_eq!(targets, StoredMeta::new(1, b"t1".to_vec()));
    }
}
