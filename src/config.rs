//! Configuration for the notary server.
//!
//! The [`Config`] structure mirrors a `server.toml` file.  Only the
//! `[server]` table is mandatory; every other section falls back to
//! defaults that give an in-memory store and a local signer, which
//! is what tests and development setups want.
//!
//! Example `server.toml`:
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:4443"
//! tls_cert_file = "fixtures/notary-server.crt"
//! tls_key_file = "fixtures/notary-server.key"
//!
//! [logging]
//! level = "info"
//!
//! [store]
//! backend = "sqlite"
//! db_path = "/var/lib/notary/metadata.db"
//!
//! [trust_service]
//! type = "remote"
//! hostname = "notary-signer"
//! port = 7899
//! tls_ca_file = "fixtures/root-ca.crt"
//! tls_client_cert = "fixtures/notary-server.crt"
//! tls_client_key = "fixtures/notary-server.key"
//! timeout_ms = 5000
//!
//! [update]
//! root_rotation = "dual_threshold"
//! auto_timestamp = true
//! timestamp_validity_secs = 1209600
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Top level configuration.  Each field corresponds to a table in
/// the TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub trust_service: TrustServiceConfig,
    #[serde(default)]
    pub update: UpdatePolicy,
}

/// Listener parameters for the frontend.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    pub addr: String,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingSection {
    pub fn level(&self) -> Result<tracing::Level> {
        self.level
            .parse()
            .map_err(|_| anyhow!("unknown logging level {:?}", self.level))
    }
}

/// Which metadata store backend to open.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Everything is lost on restart.
    #[default]
    Memory,
    Sqlite { db_path: PathBuf },
}

/// Which trust service signs server-produced metadata.  The choice
/// is made once here; there is no fallback from one to the other.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrustServiceConfig {
    Local {
        /// Where generated private keys are persisted.  Without it
        /// keys only live as long as the process.
        #[serde(default)]
        key_file: Option<PathBuf>,
    },
    Remote(RemoteSignerConfig),
}

impl Default for TrustServiceConfig {
    fn default() -> Self {
        TrustServiceConfig::Local { key_file: None }
    }
}

/// Connection parameters for a remote signing service.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RemoteSignerConfig {
    /// Host name; also the name the signer's certificate must carry.
    pub hostname: String,
    pub port: u16,
    /// CA that issued the signer's certificate.
    pub tls_ca_file: PathBuf,
    /// Certificate and key this server presents to the signer.
    pub tls_client_cert: PathBuf,
    pub tls_client_key: PathBuf,
    #[serde(default = "default_signer_timeout_ms")]
    pub timeout_ms: u64,
}

impl RemoteSignerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_signer_timeout_ms() -> u64 {
    5_000
}

/// How root rotations are authorised.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RootRotationPolicy {
    /// The new root must meet the previous root's threshold with the
    /// previous keys and its own threshold with its own keys.
    #[default]
    DualThreshold,
    /// Only the previous root's threshold is checked.
    PreviousOnly,
}

/// Knobs of the update protocol.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UpdatePolicy {
    pub root_rotation: RootRotationPolicy,
    /// Sign a fresh timestamp when a bundle brings a snapshot but no
    /// timestamp and the server holds an authorised timestamp key.
    pub auto_timestamp: bool,
    /// Lifetime written into server-produced timestamps.
    pub timestamp_validity_secs: u32,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            root_rotation: RootRotationPolicy::DualThreshold,
            auto_timestamp: true,
            timestamp_validity_secs: 14 * 24 * 60 * 60,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow!("failed to parse config: {}", e))
    }
}
