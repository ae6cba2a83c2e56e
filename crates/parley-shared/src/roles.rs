//! Organization-level roles and role-flag sets.
//!
//! Roles form a small closed set. Broadcast notifications address roles
//! through a [`RoleSet`] value, so visibility is a set-membership test
//! rather than a string-keyed column lookup that could silently miss an
//! unmapped role.

use serde::{Deserialize, Serialize};

/// Organization-level role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Coordinator,
    Member,
    Unassigned,
}

impl Role {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Coordinator => "coordinator",
            Role::Member => "member",
            Role::Unassigned => "unassigned",
        }
    }

    /// Parse the stable string form. Unknown strings map to `Unassigned`
    /// rather than failing, so a directory entry written by a newer
    /// deployment never breaks reads.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "admin" => Role::Admin,
            "coordinator" => Role::Coordinator,
            "member" => Role::Member,
            _ => Role::Unassigned,
        }
    }
}

/// Which roles a broadcast notification addresses.
///
/// `Unassigned` is deliberately not addressable: a broadcast always targets
/// users holding a real role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub coordinator: bool,
    #[serde(default)]
    pub member: bool,
}

impl RoleSet {
    /// A set containing only the given role. `Unassigned` yields the empty set.
    pub fn only(role: Role) -> Self {
        let mut set = Self::default();
        match role {
            Role::Admin => set.admin = true,
            Role::Coordinator => set.coordinator = true,
            Role::Member => set.member = true,
            Role::Unassigned => {}
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        !(self.admin || self.coordinator || self.member)
    }

    /// Whether a viewer holding `role` matches this set.
    pub fn contains(&self, role: Role) -> bool {
        match role {
            Role::Admin => self.admin,
            Role::Coordinator => self.coordinator,
            Role::Member => self.member,
            Role::Unassigned => false,
        }
    }
}
