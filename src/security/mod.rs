//! Signature checks applied to submitted metadata.

pub mod verify;

pub use verify::{count_valid_signatures, verify};
