//! Directory profiles as read from the external identity collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::roles::Role;

/// Fallback label when a profile carries no usable name at all.
pub const ANONYMOUS_LABEL: &str = "Someone";

/// Display metadata for a user, mirrored from the identity provider.
///
/// This subsystem never authors these fields; it only syncs and reads them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub full_name: Option<String>,
    /// Contact handle, e.g. an email address. Only the local part is ever
    /// shown to other users.
    pub handle: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    /// Human-readable label for this user, with a fixed precedence:
    /// display name, then full name, then the local part of the contact
    /// handle, then [`ANONYMOUS_LABEL`]. Always non-empty.
    pub fn display_label(&self) -> String {
        if let Some(name) = non_blank(self.display_name.as_deref()) {
            return name.to_string();
        }
        if let Some(name) = non_blank(self.full_name.as_deref()) {
            return name.to_string();
        }
        if let Some(handle) = non_blank(self.handle.as_deref()) {
            let local = handle.split('@').next().unwrap_or(handle).trim();
            if !local.is_empty() {
                return local.to_string();
            }
        }
        ANONYMOUS_LABEL.to_string()
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
