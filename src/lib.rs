//! A trust metadata server for update framework collections.
//!
//! Collections, identified by a globally unique name (GUN), hold
//! signed `root`, `targets`, `snapshot` and `timestamp` documents.
//! The server stores every version of every role, accepts new
//! versions only through the [`coordinator`], which checks
//! signatures, root rotations and cross-role consistency before
//! committing a bundle atomically, and can sign timestamps itself
//! through a pluggable [`signer`].
//!
//! Start with [`server::NotaryServer`] to see how the pieces fit.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod network;
pub mod protocol;
pub mod security;
pub mod server;
pub mod signer;
pub mod storage;
pub mod tuf;
