//! Notification rows.
//!
//! Two addressing modes share one table. Message fan-out materializes one
//! row per recipient (receiver_id set, all role flags false). A role
//! broadcast stores a single row (receiver_id NULL, one or more role flags
//! set) whose audience is resolved at read time against the viewer's
//! current role, so it reaches a dynamically changing set of users without
//! per-user rows.

use parley_shared::{Role, RoleSet};
use rusqlite::params;
use uuid::Uuid;

use crate::database::{now, ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, Notification};

impl Database {
    /// Materialize the per-recipient notifications for one appended message.
    ///
    /// One batch transaction; each row is `INSERT OR IGNORE` against the
    /// `(message_id, receiver_id)` unique index, so re-running the fan-out
    /// for the same message (a retry after a partial failure) inserts only
    /// what is missing. Returns the rows actually inserted this call.
    pub fn insert_message_fanout(
        &self,
        message: &Message,
        sender_label: &str,
        recipients: &[Uuid],
    ) -> Result<Vec<Notification>> {
        let tx = self.conn().unchecked_transaction()?;

        let mut inserted = Vec::new();
        for recipient in recipients {
            let notification = Notification {
                id: Uuid::new_v4(),
                sender_id: Some(message.sender_id),
                receiver_id: Some(*recipient),
                message_id: Some(message.id),
                title: format!("{sender_label} sent you a message"),
                content: message.content.clone(),
                image_url: None,
                action_url: Some(format!("/conversations/{}", message.channel_id)),
                role_flags: RoleSet::default(),
                is_read: false,
                created_at: now(),
            };

            let affected = tx.execute(
                "INSERT OR IGNORE INTO notifications
                     (id, sender_id, receiver_id, message_id, title, content,
                      image_url, action_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    notification.id.to_string(),
                    notification.sender_id.map(|s| s.to_string()),
                    notification.receiver_id.map(|r| r.to_string()),
                    notification.message_id.map(|m| m.to_string()),
                    notification.title,
                    notification.content,
                    notification.image_url,
                    notification.action_url,
                    ts_to_sql(notification.created_at),
                ],
            )?;
            if affected > 0 {
                inserted.push(notification);
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Store a role broadcast: one row visible to every current holder of
    /// the flagged roles. Rejects an empty flag set (`InvalidAudience`).
    pub fn broadcast(
        &self,
        title: &str,
        content: Option<&str>,
        role_flags: RoleSet,
        image_url: Option<&str>,
        action_url: Option<&str>,
    ) -> Result<Notification> {
        if role_flags.is_empty() {
            return Err(StoreError::InvalidAudience(
                "a broadcast must address at least one role".into(),
            ));
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            sender_id: None,
            receiver_id: None,
            message_id: None,
            title: title.to_string(),
            content: content.map(str::to_string),
            image_url: image_url.map(str::to_string),
            action_url: action_url.map(str::to_string),
            role_flags,
            is_read: false,
            created_at: now(),
        };

        self.conn().execute(
            "INSERT INTO notifications
                 (id, title, content, image_url, action_url,
                  for_admin, for_coordinator, for_member, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                notification.id.to_string(),
                notification.title,
                notification.content,
                notification.image_url,
                notification.action_url,
                notification.role_flags.admin,
                notification.role_flags.coordinator,
                notification.role_flags.member,
                ts_to_sql(notification.created_at),
            ],
        )?;

        tracing::info!(notification = %notification.id, flags = ?notification.role_flags, "role broadcast stored");
        Ok(notification)
    }

    /// Notifications visible to one viewer, newest first: rows addressed to
    /// them directly, plus broadcasts flagged for their current role.
    pub fn list_notifications_for_viewer(
        &self,
        viewer: Uuid,
        role: Role,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        // Closed role enum, so the flag column is a static name rather
        // than a string-keyed lookup that could miss an unmapped role.
        let flag_column = match role {
            Role::Admin => Some("for_admin"),
            Role::Coordinator => Some("for_coordinator"),
            Role::Member => Some("for_member"),
            Role::Unassigned => None,
        };

        let sql = match flag_column {
            Some(col) => format!(
                "SELECT id, sender_id, receiver_id, message_id, title, content,
                        image_url, action_url, for_admin, for_coordinator,
                        for_member, is_read, created_at
                 FROM notifications
                 WHERE receiver_id = ?1 OR {col} = 1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ),
            None => "SELECT id, sender_id, receiver_id, message_id, title, content,
                            image_url, action_url, for_admin, for_coordinator,
                            for_member, is_read, created_at
                     FROM notifications
                     WHERE receiver_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2"
                .to_string(),
        };

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![viewer.to_string(), limit], row_to_notification)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Fetch a single notification by id.
    pub fn get_notification(&self, id: Uuid) -> Result<Notification> {
        self.conn()
            .query_row(
                "SELECT id, sender_id, receiver_id, message_id, title, content,
                        image_url, action_url, for_admin, for_coordinator,
                        for_member, is_read, created_at
                 FROM notifications WHERE id = ?1",
                params![id.to_string()],
                row_to_notification,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

/// Map a `rusqlite::Row` to a [`Notification`].
fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id_str: String = row.get(0)?;
    let sender_str: Option<String> = row.get(1)?;
    let receiver_str: Option<String> = row.get(2)?;
    let message_str: Option<String> = row.get(3)?;
    let title: String = row.get(4)?;
    let content: Option<String> = row.get(5)?;
    let image_url: Option<String> = row.get(6)?;
    let action_url: Option<String> = row.get(7)?;
    let for_admin: bool = row.get(8)?;
    let for_coordinator: bool = row.get(9)?;
    let for_member: bool = row.get(10)?;
    let is_read: bool = row.get(11)?;
    let created_str: String = row.get(12)?;

    let parse = |s: &str, idx: usize| {
        Uuid::parse_str(s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    };

    let id = parse(&id_str, 0)?;
    let sender_id = sender_str.as_deref().map(|s| parse(s, 1)).transpose()?;
    let receiver_id = receiver_str.as_deref().map(|s| parse(s, 2)).transpose()?;
    let message_id = message_str.as_deref().map(|s| parse(s, 3)).transpose()?;

    let created_at = ts_from_sql(&created_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Notification {
        id,
        sender_id,
        receiver_id,
        message_id,
        title,
        content,
        image_url,
        action_url,
        role_flags: RoleSet {
            admin: for_admin,
            coordinator: for_coordinator,
            member: for_member,
        },
        is_read,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_user, test_db};

    #[test]
    fn fanout_excludes_sender_and_dedups_on_retry() {
        let db = test_db();
        let a = new_user(&db, "Ada", Role::Member);
        let b = new_user(&db, "B", Role::Member);
        let c = new_user(&db, "C", Role::Member);
        let group = db.create_group_channel("Team", a.id, &[b.id, c.id]).unwrap();

        let message = db.append(group.id, a.id, Some("standup?"), Vec::new()).unwrap();
        let recipients: Vec<Uuid> = db
            .participants_unchecked(group.id)
            .unwrap()
            .into_iter()
            .filter(|id| *id != a.id)
            .collect();

        let first = db.insert_message_fanout(&message, "Ada", &recipients).unwrap();
        assert_eq!(first.len(), 2);
        for n in &first {
            assert_eq!(n.title, "Ada sent you a message");
            assert_eq!(n.sender_id, Some(a.id));
            assert!(n.role_flags.is_empty());
        }

        // Retry after a simulated partial failure: nothing new appears.
        let second = db.insert_message_fanout(&message, "Ada", &recipients).unwrap();
        assert!(second.is_empty());

        let for_b = db
            .list_notifications_for_viewer(b.id, Role::Member, 10)
            .unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].receiver_id, Some(b.id));
    }

    #[test]
    fn empty_audience_is_a_no_op() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);
        let channel = db.find_or_create_direct_channel(a.id, b.id).unwrap();
        let message = db.append(channel.id, a.id, Some("hi"), Vec::new()).unwrap();

        let inserted = db.insert_message_fanout(&message, "A", &[]).unwrap();
        assert!(inserted.is_empty());
    }

    #[test]
    fn broadcast_rejects_empty_flags() {
        let db = test_db();
        assert!(matches!(
            db.broadcast("Maintenance", None, RoleSet::default(), None, None),
            Err(StoreError::InvalidAudience(_))
        ));
    }

    #[test]
    fn broadcast_is_visible_by_role_not_by_row() {
        let db = test_db();
        let admin = new_user(&db, "Root", Role::Admin);
        let other_admin = new_user(&db, "Root2", Role::Admin);
        let member = new_user(&db, "Plain", Role::Member);
        let unassigned = new_user(&db, "New", Role::Unassigned);

        let broadcast = db
            .broadcast(
                "Maintenance window",
                Some("Sunday 02:00"),
                RoleSet::only(Role::Admin),
                None,
                Some("/admin/status"),
            )
            .unwrap();

        for viewer in [admin.id, other_admin.id] {
            let seen = db.list_notifications_for_viewer(viewer, Role::Admin, 10).unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].id, broadcast.id);
            assert_eq!(seen[0].receiver_id, None);
        }

        assert!(db
            .list_notifications_for_viewer(member.id, Role::Member, 10)
            .unwrap()
            .is_empty());
        assert!(db
            .list_notifications_for_viewer(unassigned.id, Role::Unassigned, 10)
            .unwrap()
            .is_empty());
    }
}
