//! Canonical serialisation and hashing.
//!
//! Signatures are computed over the canonical form of the `signed`
//! portion of a metadata envelope: compact JSON with object keys in
//! lexicographic order.  Routing every value through
//! [`serde_json::Value`] before encoding gives us the ordering for
//! free, because its map type is a `BTreeMap`.
//!
//! Two different hashes exist and must not be confused:
//!
//! * the *signing digest* is SHA-256 over the canonical `signed`
//!   bytes, and is what keys actually sign;
//! * the *content hash* is SHA-256 over the exact bytes a client
//!   submitted (envelope and all), and is what consistency
//!   references record.

use serde::Serialize;
use sha2::{Digest as _, Sha256};

/// A SHA-256 output.
pub type Digest = [u8; 32];

/// Encode `value` in canonical JSON.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Digest that keys sign for a given `signed` body.
pub fn signing_digest<T: Serialize + ?Sized>(signed: &T) -> Result<Digest, serde_json::Error> {
    Ok(sha256(&canonical_json(signed)?))
}

pub fn sha256(bytes: &[u8]) -> Digest {
    Sha256::digest(bytes).into()
}

/// Lowercase hex SHA-256 of raw bytes.  This is the content hash
/// stored alongside every committed version.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}
