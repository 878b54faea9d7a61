//! Update framework data model: roles, keys, signatures and the
//! four metadata document types, plus the canonical encoding that
//! signatures are computed over.

pub mod canonical;
pub mod keys;
pub mod metadata;
pub mod role;

pub use canonical::Digest;
pub use keys::{KeyId, KeyRecord, PublicKey, Signature};
pub use metadata::{
    AuthorizedKeys, Document, MetaRef, ParsedMetadata, RoleKeys, RootMeta, SignedEnvelope,
    SnapshotMeta, TargetsMeta, TimestampMeta,
};
pub use role::Role;
