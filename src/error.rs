//! Error taxonomy.
//!
//! Errors are split by the component that raises them.  The store
//! and the trust service each have their own type; the update
//! coordinator wraps both transparently so that, for example, a
//! [`StoreError::VersionConflict`] reaches the caller exactly as the
//! store produced it.

use thiserror::Error;

use crate::tuf::{KeyId, Role};

/// Problems decoding a metadata document.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected} metadata, found {found}")]
    WrongType { expected: Role, found: Role },

    #[error("version must be at least 1")]
    ZeroVersion,

    #[error("missing meta entry for {0}")]
    MissingMeta(Role),

    #[error("key {0} does not match its listed identifier")]
    KeyIdMismatch(KeyId),
}

/// Errors returned by a [`MetadataStore`](crate::storage::MetadataStore).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The collection, role or version has never been written.
    #[error("{gun}/{role} not found{}", .version.map(|v| format!(" at version {v}")).unwrap_or_default())]
    NotFound {
        gun: String,
        role: Role,
        version: Option<u64>,
    },

    /// A declared version was not exactly one past the current one.
    /// Nothing from the bundle was written.
    #[error("version conflict on {gun}/{role}: expected version {expected}, bundle declares {declared}")]
    VersionConflict {
        gun: String,
        role: Role,
        expected: u64,
        declared: u64,
    },

    /// Transient backend failure.  Nothing was written, so the whole
    /// commit may be retried.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Errors returned by a [`TrustService`](crate::signer::TrustService).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    /// Connection, TLS handshake or timeout failure talking to a
    /// remote signing service.
    #[error("signing service unreachable: {0}")]
    Unreachable(String),

    /// The signer explicitly refused, e.g. because it does not hold
    /// the requested key.
    #[error("signing request rejected: {0}")]
    Rejected(String),

    /// The remote signer answered with something we cannot use.
    #[error("signing protocol error: {0}")]
    Protocol(String),

    /// Local key material could not be read or written.
    #[error("key storage error: {0}")]
    KeyStorage(String),
}

/// Errors returned by the [`UpdateCoordinator`](crate::coordinator::UpdateCoordinator).
/// Every variant means the bundle was not applied.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("unknown role {0:?}")]
    UnknownRole(String),

    #[error("bundle rejected: {0}")]
    InvalidBundle(String),

    #[error("{role} metadata is malformed: {source}")]
    MalformedMetadata {
        role: Role,
        #[source]
        source: MetadataError,
    },

    #[error("collection {0} has no trusted root")]
    NoTrustedRoot(String),

    #[error("{role} signature threshold not met: {valid} valid of {threshold} required ({keys})")]
    SignatureThresholdNotMet {
        role: Role,
        valid: usize,
        threshold: u32,
        /// Which key set was checked, e.g. "previous root keys".
        keys: &'static str,
    },

    #[error("{role} reference to {target} version {version} does not match: {reason}")]
    ConsistencyReferenceMismatch {
        role: Role,
        target: Role,
        version: u64,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

impl UpdateError {
    pub(crate) fn malformed(role: Role, source: impl Into<MetadataError>) -> Self {
        UpdateError::MalformedMetadata {
            role,
            source: source.into(),
        }
    }
}
