//! Directory mirror operations for [`UserProfile`] records.
//!
//! The identity provider owns these records; this store only syncs and
//! reads them, so the write path is a single idempotent upsert.

use chrono::{DateTime, Utc};
use parley_shared::{Role, UserProfile};
use rusqlite::params;
use uuid::Uuid;

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};

impl Database {
    /// Insert or refresh a directory entry.
    pub fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, full_name, handle, avatar_url, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 full_name    = excluded.full_name,
                 handle       = excluded.handle,
                 avatar_url   = excluded.avatar_url,
                 role         = excluded.role",
            params![
                profile.id.to_string(),
                profile.display_name,
                profile.full_name,
                profile.handle,
                profile.avatar_url,
                profile.role.as_str(),
                ts_to_sql(profile.created_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single directory entry by id.
    pub fn get_user(&self, id: Uuid) -> Result<UserProfile> {
        self.conn()
            .query_row(
                "SELECT id, display_name, full_name, handle, avatar_url, role, created_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_profile,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Whether a directory entry exists for the given id.
    pub fn user_exists(&self, id: Uuid) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Ids of every user currently holding the given role. Used to route
    /// live delivery of role broadcasts.
    pub fn list_user_ids_with_role(&self, role: Role) -> Result<Vec<Uuid>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM users WHERE role = ?1")?;
        let rows = stmt.query_map(params![role.as_str()], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(Uuid::parse_str(&row?)?);
        }
        Ok(ids)
    }
}

/// Map a `rusqlite::Row` to a [`UserProfile`].
pub(crate) fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let id_str: String = row.get(0)?;
    let display_name: Option<String> = row.get(1)?;
    let full_name: Option<String> = row.get(2)?;
    let handle: Option<String> = row.get(3)?;
    let avatar_url: Option<String> = row.get(4)?;
    let role_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = ts_from_sql(&created_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(UserProfile {
        id,
        display_name,
        full_name,
        handle,
        avatar_url,
        role: Role::from_str_lossy(&role_str),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_user, test_db};

    #[test]
    fn upsert_is_idempotent_and_refreshes() {
        let db = test_db();
        let mut profile = new_user(&db, "Ada", Role::Member);

        profile.display_name = Some("Ada L.".into());
        db.upsert_user(&profile).unwrap();

        let read = db.get_user(profile.id).unwrap();
        assert_eq!(read.display_name.as_deref(), Some("Ada L."));
    }

    #[test]
    fn missing_user_is_not_found() {
        let db = test_db();
        assert!(matches!(db.get_user(Uuid::new_v4()), Err(StoreError::NotFound)));
    }

    #[test]
    fn role_listing_only_matches_that_role() {
        let db = test_db();
        let admin = new_user(&db, "Root", Role::Admin);
        let _member = new_user(&db, "Plain", Role::Member);

        let admins = db.list_user_ids_with_role(Role::Admin).unwrap();
        assert_eq!(admins, vec![admin.id]);
    }
}
