//! Shared helpers for the store test suites.

use parley_shared::{Role, UserProfile};
use uuid::Uuid;

use crate::database::{now, Database};

pub(crate) fn test_db() -> Database {
    Database::open_in_memory().expect("in-memory database")
}

/// Create and persist a directory entry with the given display name.
pub(crate) fn new_user(db: &Database, name: &str, role: Role) -> UserProfile {
    let profile = UserProfile {
        id: Uuid::new_v4(),
        display_name: Some(name.to_string()),
        full_name: None,
        handle: None,
        avatar_url: None,
        role,
        created_at: now(),
    };
    db.upsert_user(&profile).expect("upsert user");
    profile
}
