//! The per-channel append-only message log.
//!
//! Messages within a channel are totally ordered by `(created_at, id)`.
//! Both timestamps (fixed-width RFC 3339) and ids (UUID text) compare the
//! same way in SQL and in Rust, so the persisted log, the backfill pages,
//! and the live stream all agree on relative order.

use rusqlite::params;
use uuid::Uuid;

use crate::database::{now, ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{Attachment, Message};

impl Database {
    /// Append a message to a channel's log.
    ///
    /// Rejects non-members (`Forbidden`) and messages with neither content
    /// nor attachments (`InvalidMessage`). The insert and the unread-count
    /// increments for every other member commit in one transaction, so the
    /// message is durable before any fan-out or live delivery sees it.
    pub fn append(
        &self,
        channel_id: Uuid,
        sender_id: Uuid,
        content: Option<&str>,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        self.require_membership(channel_id, sender_id)?;

        let content = content
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        if content.is_none() && attachments.is_empty() {
            return Err(StoreError::InvalidMessage(
                "a message needs content or at least one attachment".into(),
            ));
        }

        let message = Message {
            id: Uuid::new_v4(),
            channel_id,
            sender_id,
            content,
            attachments,
            is_edited: false,
            deleted_at: None,
            created_at: now(),
        };

        let attachments_json = if message.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.attachments)?)
        };

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages (id, channel_id, sender_id, content, attachments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.channel_id.to_string(),
                message.sender_id.to_string(),
                message.content,
                attachments_json,
                ts_to_sql(message.created_at),
            ],
        )?;
        // Relative increment, never read-then-write: concurrent senders
        // must not lose each other's updates.
        tx.execute(
            "UPDATE memberships SET unread_count = unread_count + 1
             WHERE channel_id = ?1 AND user_id != ?2",
            params![channel_id.to_string(), sender_id.to_string()],
        )?;
        tx.commit()?;

        tracing::debug!(channel = %channel_id, message = %message.id, "message appended");
        Ok(message)
    }

    /// Backfill a page of a channel's log.
    ///
    /// Pages backwards from the most recent message (or from strictly
    /// before `before`), returning the page in ascending `(created_at, id)`
    /// order. Soft-deleted messages are skipped.
    pub fn list_range(
        &self,
        channel_id: Uuid,
        caller: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.require_membership(channel_id, caller)?;

        let mut messages = match before {
            None => {
                let mut stmt = self.conn().prepare(
                    "SELECT id, channel_id, sender_id, content, attachments,
                            is_edited, deleted_at, created_at
                     FROM messages
                     WHERE channel_id = ?1 AND deleted_at IS NULL
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![channel_id.to_string(), limit], row_to_message)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            Some(cursor_id) => {
                let cursor = self.get_message(cursor_id)?;
                if cursor.channel_id != channel_id {
                    return Err(StoreError::NotFound);
                }
                let cursor_ts = ts_to_sql(cursor.created_at);

                let mut stmt = self.conn().prepare(
                    "SELECT id, channel_id, sender_id, content, attachments,
                            is_edited, deleted_at, created_at
                     FROM messages
                     WHERE channel_id = ?1 AND deleted_at IS NULL
                       AND (created_at < ?2 OR (created_at = ?2 AND id < ?3))
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![
                        channel_id.to_string(),
                        cursor_ts,
                        cursor_id.to_string(),
                        limit
                    ],
                    row_to_message,
                )?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        messages.reverse();
        Ok(messages)
    }

    /// Fetch a single message by id, deleted or not.
    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, channel_id, sender_id, content, attachments,
                        is_edited, deleted_at, created_at
                 FROM messages WHERE id = ?1",
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Replace a message's content and flip its edited flag.
    ///
    /// Only the sender may edit. `created_at` never changes, so the
    /// channel's total order is preserved.
    pub fn mark_edited(&self, message_id: Uuid, caller: Uuid, new_content: &str) -> Result<Message> {
        let message = self.get_message(message_id)?;
        if message.sender_id != caller {
            return Err(StoreError::forbidden("only the sender can edit a message"));
        }

        let new_content = new_content.trim();
        if new_content.is_empty() && message.attachments.is_empty() {
            return Err(StoreError::InvalidMessage(
                "an edit cannot leave the message empty".into(),
            ));
        }

        self.conn().execute(
            "UPDATE messages SET content = ?1, is_edited = 1 WHERE id = ?2",
            params![new_content, message_id.to_string()],
        )?;

        self.get_message(message_id)
    }

    /// Soft-delete a message. Only the sender may delete; the row is kept
    /// so ordering of the remaining log is untouched.
    ///
    /// Members whose read cursor had not reached the message lose one from
    /// their unread count, keeping the counter equal to the number of
    /// visible unread messages. Deleting twice is a no-op.
    pub fn soft_delete_message(&self, message_id: Uuid, caller: Uuid) -> Result<()> {
        let message = self.get_message(message_id)?;
        if message.sender_id != caller {
            return Err(StoreError::forbidden(
                "only the sender can delete a message",
            ));
        }
        if message.deleted_at.is_some() {
            return Ok(());
        }

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "UPDATE messages SET deleted_at = ?1 WHERE id = ?2",
            params![ts_to_sql(now()), message_id.to_string()],
        )?;
        tx.execute(
            "UPDATE memberships SET unread_count = MAX(unread_count - 1, 0)
             WHERE channel_id = ?1 AND user_id != ?2
               AND (last_read_at IS NULL
                    OR last_read_at < ?3
                    OR (last_read_at = ?3
                        AND (last_read_message_id IS NULL OR last_read_message_id < ?4)))",
            params![
                message.channel_id.to_string(),
                message.sender_id.to_string(),
                ts_to_sql(message.created_at),
                message.id.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let channel_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let content: Option<String> = row.get(3)?;
    let attachments_json: Option<String> = row.get(4)?;
    let is_edited: bool = row.get(5)?;
    let deleted_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let channel_id = Uuid::parse_str(&channel_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender_id = Uuid::parse_str(&sender_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let attachments: Vec<Attachment> = match attachments_json {
        None => Vec::new(),
        Some(json) => serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
    };

    let deleted_at = deleted_str
        .map(|s| ts_from_sql(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let created_at = ts_from_sql(&created_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id,
        channel_id,
        sender_id,
        content,
        attachments,
        is_edited,
        deleted_at,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_user, test_db};
    use parley_shared::Role;

    fn direct(db: &Database) -> (Uuid, Uuid, Uuid) {
        let a = new_user(db, "A", Role::Member);
        let b = new_user(db, "B", Role::Member);
        let channel = db.find_or_create_direct_channel(a.id, b.id).unwrap();
        (channel.id, a.id, b.id)
    }

    #[test]
    fn append_rejects_non_members_and_empty_messages() {
        let db = test_db();
        let (channel, a, _b) = direct(&db);
        let outsider = new_user(&db, "X", Role::Member);

        assert!(matches!(
            db.append(channel, outsider.id, Some("hi"), Vec::new()),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.append(channel, a, Some("   "), Vec::new()),
            Err(StoreError::InvalidMessage(_))
        ));
        assert!(matches!(
            db.append(Uuid::new_v4(), a, Some("hi"), Vec::new()),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            db.list_range(channel, outsider.id, None, 10),
            Err(StoreError::Forbidden(_))
        ));
    }

    #[test]
    fn attachment_only_message_is_valid() {
        let db = test_db();
        let (channel, a, _b) = direct(&db);

        let attachment = Attachment {
            url: "https://files.example/report.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 12_345,
        };
        let message = db.append(channel, a, None, vec![attachment.clone()]).unwrap();
        assert_eq!(message.content, None);

        let read = db.get_message(message.id).unwrap();
        assert_eq!(read.attachments, vec![attachment]);
    }

    #[test]
    fn list_range_pages_backwards_in_ascending_order() {
        let db = test_db();
        let (channel, a, b) = direct(&db);

        let mut ids = Vec::new();
        for i in 0..5 {
            let sender = if i % 2 == 0 { a } else { b };
            ids.push(
                db.append(channel, sender, Some(&format!("m{i}")), Vec::new())
                    .unwrap()
                    .id,
            );
        }

        let newest = db.list_range(channel, a, None, 2).unwrap();
        assert_eq!(
            newest.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![ids[3], ids[4]]
        );

        let older = db.list_range(channel, a, Some(newest[0].id), 10).unwrap();
        assert_eq!(
            older.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![ids[0], ids[1], ids[2]]
        );

        // Pages are monotonically non-decreasing in (created_at, id).
        for page in [&newest, &older] {
            for pair in page.windows(2) {
                assert!(
                    (pair[0].created_at, pair[0].id.to_string())
                        <= (pair[1].created_at, pair[1].id.to_string())
                );
            }
        }
    }

    #[test]
    fn append_returns_exactly_what_the_log_stores() {
        let db = test_db();
        let (channel, a, _b) = direct(&db);

        let sent = db.append(channel, a, Some("hello"), Vec::new()).unwrap();
        let read = db.get_message(sent.id).unwrap();

        // The struct handed back by append, which becomes the HTTP body and
        // the live event, must be byte-equal to a later read of the row.
        assert_eq!(read, sent);
        assert_eq!(read.created_at, sent.created_at);
    }

    #[test]
    fn deleting_an_unread_message_releases_its_unread_count() {
        let db = test_db();
        let (channel, a, b) = direct(&db);

        let first = db.append(channel, a, Some("one"), Vec::new()).unwrap();
        db.append(channel, a, Some("two"), Vec::new()).unwrap();
        assert_eq!(db.get_membership(channel, b).unwrap().unread_count, 2);

        db.soft_delete_message(first.id, a).unwrap();
        let membership = db.get_membership(channel, b).unwrap();
        assert_eq!(membership.unread_count, 1);
        assert_eq!(membership.unread_count, db.computed_unread(channel, b).unwrap());

        // Deleting again changes nothing.
        db.soft_delete_message(first.id, a).unwrap();
        assert_eq!(db.get_membership(channel, b).unwrap().unread_count, 1);
    }

    #[test]
    fn deleting_an_already_read_message_keeps_counts() {
        let db = test_db();
        let (channel, a, b) = direct(&db);

        let seen = db.append(channel, a, Some("seen"), Vec::new()).unwrap();
        db.mark_read(channel, b, Role::Member, b).unwrap();
        db.append(channel, a, Some("pending"), Vec::new()).unwrap();
        assert_eq!(db.get_membership(channel, b).unwrap().unread_count, 1);

        // The deleted message was behind B's cursor: nothing to release.
        db.soft_delete_message(seen.id, a).unwrap();
        let membership = db.get_membership(channel, b).unwrap();
        assert_eq!(membership.unread_count, 1);
        assert_eq!(membership.unread_count, db.computed_unread(channel, b).unwrap());
    }

    #[test]
    fn edit_is_sender_only_and_flips_the_flag() {
        let db = test_db();
        let (channel, a, b) = direct(&db);
        let message = db.append(channel, a, Some("draft"), Vec::new()).unwrap();

        assert!(matches!(
            db.mark_edited(message.id, b, "hijacked"),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.mark_edited(message.id, a, "  "),
            Err(StoreError::InvalidMessage(_))
        ));

        let edited = db.mark_edited(message.id, a, "final").unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content.as_deref(), Some("final"));
        assert_eq!(edited.created_at, message.created_at);
    }

    #[test]
    fn soft_deleted_messages_leave_the_page_but_keep_order() {
        let db = test_db();
        let (channel, a, _b) = direct(&db);

        let first = db.append(channel, a, Some("one"), Vec::new()).unwrap();
        let second = db.append(channel, a, Some("two"), Vec::new()).unwrap();
        let third = db.append(channel, a, Some("three"), Vec::new()).unwrap();

        db.soft_delete_message(second.id, a).unwrap();

        let page = db.list_range(channel, a, None, 10).unwrap();
        assert_eq!(
            page.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![first.id, third.id]
        );
    }
}
