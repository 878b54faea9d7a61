//! Metadata roles.
//!
//! A collection carries exactly four top level roles.  Each role
//! has its own version history in the store and its own key set in
//! the root metadata.  Role names appear on the wire in lowercase
//! (`"root"`, `"targets"`, ...) both as `_type` values and as keys
//! of the root `roles` table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the four top level roles.  Variants are ordered so that
/// iterating a `BTreeMap<Role, _>` visits root first and timestamp
/// last, which is also the order in which a bundle is verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl Role {
    /// Every role, in verification order.
    pub const ALL: [Role; 4] = [Role::Root, Role::Targets, Role::Snapshot, Role::Timestamp];

    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Targets => "targets",
            Role::Snapshot => "snapshot",
            Role::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a role name is not one of the four known roles.
/// Carries the offending name for error messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownRoleName(pub String);

impl fmt::Display for UnknownRoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role {:?}", self.0)
    }
}

impl std::error::Error for UnknownRoleName {}

impl FromStr for Role {
    type Err = UnknownRoleName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(Role::Root),
            "targets" => Ok(Role::Targets),
            "snapshot" => Ok(Role::Snapshot),
            "timestamp" => Ok(Role::Timestamp),
            other => Err(UnknownRoleName(other.to_string())),
        }
    }
}
