//! Unread counters and read cursors.
//!
//! `unread_count` is a denormalized counter maintained transactionally
//! alongside message insert (see [`crate::Database::append`]) and message
//! soft-delete. The source-of-truth definition is: the number of visible
//! (not soft-deleted) messages in the channel authored by someone else and
//! strictly after the user's read cursor
//! `(last_read_at, last_read_message_id)`.

use parley_shared::Role;
use rusqlite::params;
use uuid::Uuid;

use crate::database::{now, ts_to_sql, Database};
use crate::error::{Result, StoreError};

impl Database {
    /// Move a user's read cursor to the newest message in the channel and
    /// recompute the unread counter from that cursor.
    ///
    /// Idempotent. Only the user themself (or an admin acting on their
    /// behalf) may call it. The counter is written as "count of messages
    /// after this specific cursor", never an unconditional zero, so a
    /// mark-read computed before a newer message arrived still leaves that
    /// message unread. The cursor itself only advances forward.
    pub fn mark_read(
        &self,
        channel_id: Uuid,
        caller: Uuid,
        caller_role: Role,
        user: Uuid,
    ) -> Result<()> {
        if caller != user && caller_role != Role::Admin {
            return Err(StoreError::forbidden(
                "cannot mark another user's channel as read",
            ));
        }
        self.require_membership(channel_id, user)?;

        let tx = self.conn().unchecked_transaction()?;

        let newest: Option<(String, String)> = tx
            .query_row(
                "SELECT created_at, id FROM messages
                 WHERE channel_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![channel_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match newest {
            None => {
                tx.execute(
                    "UPDATE memberships
                     SET last_read_at = ?1, last_read_message_id = NULL, unread_count = 0
                     WHERE channel_id = ?2 AND user_id = ?3 AND last_read_at IS NULL",
                    params![ts_to_sql(now()), channel_id.to_string(), user.to_string()],
                )?;
            }
            Some((cursor_ts, cursor_id)) => {
                tx.execute(
                    "UPDATE memberships
                     SET last_read_at = ?1,
                         last_read_message_id = ?2,
                         unread_count = (
                             SELECT COUNT(*) FROM messages
                             WHERE channel_id = ?3
                               AND sender_id != ?4
                               AND deleted_at IS NULL
                               AND (created_at > ?1 OR (created_at = ?1 AND id > ?2))
                         )
                     WHERE channel_id = ?3 AND user_id = ?4
                       AND (last_read_at IS NULL
                            OR last_read_at < ?1
                            OR (last_read_at = ?1
                                AND (last_read_message_id IS NULL
                                     OR last_read_message_id <= ?2)))",
                    params![
                        cursor_ts,
                        cursor_id,
                        channel_id.to_string(),
                        user.to_string()
                    ],
                )?;
            }
        }

        tx.commit()?;
        tracing::debug!(channel = %channel_id, user = %user, "read cursor advanced");
        Ok(())
    }

    /// Bulk-flip notifications to read, scoped to the caller's own rows.
    ///
    /// The `receiver_id = user` filter means a guessed id belonging to
    /// someone else is never touched; if nothing matched but some of the
    /// ids do exist, that is `Forbidden`, and if none exist, `NotFound`.
    /// Returns the number of rows updated.
    pub fn mark_notifications_read(&self, ids: &[Uuid], user: Uuid) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = (2..ids.len() + 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql_params: Vec<String> = Vec::with_capacity(ids.len() + 1);
        sql_params.push(user.to_string());
        sql_params.extend(ids.iter().map(|id| id.to_string()));

        let updated = self.conn().execute(
            &format!(
                "UPDATE notifications SET is_read = 1
                 WHERE receiver_id = ?1 AND id IN ({placeholders})"
            ),
            rusqlite::params_from_iter(sql_params.iter()),
        )?;

        if updated == 0 {
            let existing: i64 = self.conn().query_row(
                &format!(
                    "SELECT COUNT(*) FROM notifications WHERE id IN ({})",
                    (1..=ids.len())
                        .map(|i| format!("?{i}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                rusqlite::params_from_iter(ids.iter().map(|id| id.to_string())),
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Err(StoreError::forbidden(
                    "notification belongs to another user",
                ));
            }
            return Err(StoreError::NotFound);
        }

        Ok(updated)
    }

    /// Recompute the unread count for (channel, user) from first
    /// principles. The invariant tests compare this against the
    /// denormalized `memberships.unread_count`.
    pub fn computed_unread(&self, channel_id: Uuid, user: Uuid) -> Result<i64> {
        let membership = self.get_membership(channel_id, user)?;

        let count = match (membership.last_read_at, membership.last_read_message_id) {
            (None, _) => self.conn().query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE channel_id = ?1 AND sender_id != ?2 AND deleted_at IS NULL",
                params![channel_id.to_string(), user.to_string()],
                |row| row.get(0),
            )?,
            (Some(ts), cursor_id) => {
                let cursor_id = cursor_id.map(|id| id.to_string()).unwrap_or_default();
                self.conn().query_row(
                    "SELECT COUNT(*) FROM messages
                     WHERE channel_id = ?1 AND sender_id != ?2 AND deleted_at IS NULL
                       AND (created_at > ?3 OR (created_at = ?3 AND id > ?4))",
                    params![
                        channel_id.to_string(),
                        user.to_string(),
                        ts_to_sql(ts),
                        cursor_id
                    ],
                    |row| row.get(0),
                )?
            }
        };
        Ok(count)
    }
}
