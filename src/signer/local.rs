//! In-process trust service.
//!
//! Keys are held in memory.  When a key file is configured every new
//! key is written to it (as pretty printed JSON, one entry per key)
//! before it is handed out, and the file is loaded again on start,
//! so keys survive restarts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::TrustService;
use crate::error::SignerError;
use crate::tuf::{Digest, KeyId, KeyRecord, PublicKey, Role, Signature};

struct HeldKey {
    role: Role,
    key: SigningKey,
}

/// On-disk form of one key.
#[derive(Serialize, Deserialize)]
struct KeyFileEntry {
    role: Role,
    /// Base64 of the 32 byte Ed25519 seed.
    private: String,
}

fn storage_error(path: &Path, e: impl std::fmt::Display) -> SignerError {
    SignerError::KeyStorage(format!("{}: {}", path.display(), e))
}

#[derive(Default)]
pub struct LocalSigner {
    keys: RwLock<HashMap<KeyId, HeldKey>>,
    key_file: Option<PathBuf>,
}

impl LocalSigner {
    /// A signer whose keys die with the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// A signer persisting its keys to `path`.  Existing keys in the
    /// file are loaded; a missing file is fine.
    pub async fn with_key_file(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let path = path.as_ref().to_path_buf();
        let mut keys = HashMap::new();
        if path.exists() {
            let data = fs::read_to_string(&path).map_err(|e| storage_error(&path, e))?;
            let entries: Vec<KeyFileEntry> = serde_json::from_str(&data).map_err(|e| storage_error(&path, e))?;
            for entry in entries {
                let seed = BASE64
                    .decode(&entry.private)
                    .ok()
                    .and_then(|raw| <[u8; SECRET_KEY_LENGTH]>::try_from(raw).ok())
                    .ok_or_else(|| storage_error(&path, "invalid private key encoding"))?;
                let key = SigningKey::from_bytes(&seed);
                let id = PublicKey::from_ed25519(&key.verifying_key()).key_id();
                keys.insert(id, HeldKey { role: entry.role, key });
            }
            info!(path = %path.display(), count = keys.len(), "loaded signing keys");
        }
        Ok(Self {
            keys: RwLock::new(keys),
            key_file: Some(path),
        })
    }

    /// Take ownership of an existing private key.
    pub async fn import(&self, role: Role, key: SigningKey) -> Result<KeyRecord, SignerError> {
        let record = KeyRecord::new(role, PublicKey::from_ed25519(&key.verifying_key()));
        let mut keys = self.keys.write().await;
        keys.insert(record.id.clone(), HeldKey { role, key });
        if let Err(e) = self.save(&keys) {
            keys.remove(&record.id);
            return Err(e);
        }
        Ok(record)
    }

    /// Public half of a held key.
    pub async fn public_key(&self, key_id: &KeyId) -> Option<KeyRecord> {
        let keys = self.keys.read().await;
        let held = keys.get(key_id)?;
        Some(KeyRecord::new(held.role, PublicKey::from_ed25519(&held.key.verifying_key())))
    }

    fn save(&self, keys: &HashMap<KeyId, HeldKey>) -> Result<(), SignerError> {
        let Some(path) = &self.key_file else {
            return Ok(());
        };
        let mut entries: Vec<_> = keys.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let entries: Vec<KeyFileEntry> = entries
            .into_iter()
            .map(|(_, held)| KeyFileEntry {
                role: held.role,
                private: BASE64.encode(held.key.to_bytes()),
            })
            .collect();
        let data = serde_json::to_string_pretty(&entries).map_err(|e| storage_error(path, e))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|e| storage_error(&tmp, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)).map_err(|e| storage_error(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| storage_error(path, e))
    }
}

#[async_trait]
impl TrustService for LocalSigner {
    async fn generate_key(&self, role: Role) -> Result<KeyRecord, SignerError> {
        let record = self.import(role, SigningKey::generate(&mut OsRng)).await?;
        debug!(key_id = %record.id, %role, "generated key");
        Ok(record)
    }

    async fn sign(&self, key_id: &KeyId, digest: &Digest) -> Result<Signature, SignerError> {
        let keys = self.keys.read().await;
        let held = keys
            .get(key_id)
            .ok_or_else(|| SignerError::Rejected(format!("no private key for {key_id}")))?;
        Ok(Signature::from_ed25519(key_id.clone(), &held.key.sign(digest)))
    }
}
