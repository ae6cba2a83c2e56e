//! Channel records, memberships, and the conversation-list projection.

use parley_shared::profile::ANONYMOUS_LABEL;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::database::{now, ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{
    Channel, ChannelRole, ConversationSummary, Membership, MessagePreview, ParticipantInfo,
};
use crate::users::row_to_profile;

/// Canonical key for the unordered participant pair of a direct channel.
/// The UNIQUE constraint on this column is the find-or-create race guard.
fn direct_pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a.to_string() <= b.to_string() {
        (a, b)
    } else {
        (b, a)
    };
    format!("{lo}:{hi}")
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Find the direct channel between two users, creating it (plus both
    /// memberships) if none exists.
    ///
    /// Idempotent on the unordered pair: concurrent callers racing to
    /// create the same pair converge on one channel, because the loser's
    /// `INSERT OR IGNORE` hits the `pair_key` UNIQUE constraint and
    /// re-reads instead of erroring.
    pub fn find_or_create_direct_channel(&self, a: Uuid, b: Uuid) -> Result<Channel> {
        if a == b {
            return Err(StoreError::InvalidParticipants(
                "a direct channel needs two distinct users".into(),
            ));
        }
        if !self.user_exists(a)? || !self.user_exists(b)? {
            return Err(StoreError::InvalidParticipants(
                "participant is not in the directory".into(),
            ));
        }

        let pair_key = direct_pair_key(a, b);
        let tx = self.conn().unchecked_transaction()?;

        if let Some(existing) = direct_by_pair_key(&tx, &pair_key)? {
            tx.commit()?;
            return Ok(existing);
        }

        let channel = Channel {
            id: Uuid::new_v4(),
            is_group: false,
            name: None,
            created_at: now(),
            removed_at: None,
        };

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO channels (id, is_group, name, pair_key, created_at)
             VALUES (?1, 0, NULL, ?2, ?3)",
            params![
                channel.id.to_string(),
                pair_key,
                ts_to_sql(channel.created_at),
            ],
        )?;

        if inserted == 0 {
            // Lost the race: another caller created the pair meanwhile.
            let existing = direct_by_pair_key(&tx, &pair_key)?.ok_or(StoreError::NotFound)?;
            tx.commit()?;
            tracing::debug!(channel = %existing.id, "direct channel create raced, reusing");
            return Ok(existing);
        }

        for user in [a, b] {
            tx.execute(
                "INSERT INTO memberships (channel_id, user_id, channel_role)
                 VALUES (?1, ?2, 'member')",
                params![channel.id.to_string(), user.to_string()],
            )?;
        }

        tx.commit()?;
        tracing::info!(channel = %channel.id, "created direct channel");
        Ok(channel)
    }

    /// Create a group channel. The creator becomes the owner.
    pub fn create_group_channel(
        &self,
        name: &str,
        creator: Uuid,
        members: &[Uuid],
    ) -> Result<Channel> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidParticipants(
                "a group channel requires a name".into(),
            ));
        }

        let mut all = vec![creator];
        for m in members {
            if !all.contains(m) {
                all.push(*m);
            }
        }
        if all.len() < 2 {
            return Err(StoreError::InvalidParticipants(
                "a group channel needs at least two distinct members".into(),
            ));
        }
        for user in &all {
            if !self.user_exists(*user)? {
                return Err(StoreError::InvalidParticipants(
                    "participant is not in the directory".into(),
                ));
            }
        }

        let channel = Channel {
            id: Uuid::new_v4(),
            is_group: true,
            name: Some(name.to_string()),
            created_at: now(),
            removed_at: None,
        };

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO channels (id, is_group, name, pair_key, created_at)
             VALUES (?1, 1, ?2, NULL, ?3)",
            params![
                channel.id.to_string(),
                channel.name,
                ts_to_sql(channel.created_at),
            ],
        )?;
        for user in &all {
            let role = if *user == creator {
                ChannelRole::Owner
            } else {
                ChannelRole::Member
            };
            tx.execute(
                "INSERT INTO memberships (channel_id, user_id, channel_role)
                 VALUES (?1, ?2, ?3)",
                params![channel.id.to_string(), user.to_string(), role.as_str()],
            )?;
        }
        tx.commit()?;

        tracing::info!(channel = %channel.id, members = all.len(), "created group channel");
        Ok(channel)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single channel by id, removed or not.
    pub fn get_channel(&self, id: Uuid) -> Result<Channel> {
        self.conn()
            .query_row(
                "SELECT id, is_group, name, created_at, removed_at
                 FROM channels WHERE id = ?1",
                params![id.to_string()],
                row_to_channel,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Look up a live channel and verify the caller belongs to it.
    ///
    /// Removed or nonexistent channels are `NotFound`; an existing channel
    /// the caller is not a member of is `Forbidden` (membership is checked
    /// only after existence, so the error never leaks which ids exist to
    /// members of other channels -- a non-member always gets `Forbidden`
    /// for live channels and `NotFound` only for genuinely absent ids).
    pub fn require_membership(&self, channel_id: Uuid, user_id: Uuid) -> Result<Channel> {
        let channel = self.get_channel(channel_id)?;
        if channel.removed_at.is_some() {
            return Err(StoreError::NotFound);
        }
        if !self.is_member(channel_id, user_id)? {
            return Err(StoreError::forbidden("not a member of this channel"));
        }
        Ok(channel)
    }

    /// Whether the user currently belongs to the channel.
    pub fn is_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM memberships WHERE channel_id = ?1 AND user_id = ?2",
            params![channel_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The membership row for (channel, user).
    pub fn get_membership(&self, channel_id: Uuid, user_id: Uuid) -> Result<Membership> {
        self.conn()
            .query_row(
                "SELECT channel_id, user_id, channel_role, last_read_at,
                        last_read_message_id, unread_count
                 FROM memberships WHERE channel_id = ?1 AND user_id = ?2",
                params![channel_id.to_string(), user_id.to_string()],
                row_to_membership,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Current participant set, membership-checked for the caller.
    pub fn get_participants(&self, channel_id: Uuid, caller: Uuid) -> Result<Vec<Uuid>> {
        self.require_membership(channel_id, caller)?;
        self.participants_unchecked(channel_id)
    }

    /// Current participant set without an authorization check. For internal
    /// use on paths that already validated the caller (e.g. post-append
    /// fan-out).
    pub fn participants_unchecked(&self, channel_id: Uuid) -> Result<Vec<Uuid>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM memberships WHERE channel_id = ?1")?;
        let rows = stmt.query_map(params![channel_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(Uuid::parse_str(&row?)?);
        }
        Ok(ids)
    }

    /// The caller's conversation list, most recent activity first.
    ///
    /// A read-heavy denormalized projection rebuilt per request: channel,
    /// resolved display name, last message preview (total order
    /// `(created_at, id)`), unread count, and participant metadata.
    pub fn list_conversations_for_user(
        &self,
        user_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.is_group, c.name, c.created_at, c.removed_at, m.unread_count
             FROM channels c
             JOIN memberships m ON m.channel_id = c.id
             WHERE m.user_id = ?1 AND c.removed_at IS NULL",
        )?;

        struct Row {
            channel: Channel,
            unread_count: i64,
        }

        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok((row_to_channel(row)?, row.get::<_, i64>(5)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (channel, unread_count) = row?;
            entries.push(Row {
                channel,
                unread_count,
            });
        }

        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let participants = self.participant_infos(entry.channel.id)?;
            let last_message = self.last_message_preview(entry.channel.id)?;

            let display_name = if entry.channel.is_group {
                entry
                    .channel
                    .name
                    .clone()
                    .unwrap_or_else(|| ANONYMOUS_LABEL.to_string())
            } else {
                participants
                    .iter()
                    .find(|p| p.id != user_id)
                    .map(|p| p.display_name.clone())
                    .unwrap_or_else(|| ANONYMOUS_LABEL.to_string())
            };

            // Most recent activity; channels with no messages fall back to
            // their creation time.
            let activity_at = last_message
                .as_ref()
                .map(|m| m.created_at)
                .unwrap_or(entry.channel.created_at);

            summaries.push((
                activity_at,
                ConversationSummary {
                    channel_id: entry.channel.id,
                    is_group: entry.channel.is_group,
                    display_name,
                    last_message,
                    unread_count: entry.unread_count,
                    participants,
                },
            ));
        }

        summaries.sort_by(|a, b| b.0.cmp(&a.0));
        summaries.truncate(limit as usize);
        Ok(summaries.into_iter().map(|(_, s)| s).collect())
    }

    fn participant_infos(&self, channel_id: Uuid) -> Result<Vec<ParticipantInfo>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.display_name, u.full_name, u.handle, u.avatar_url, u.role, u.created_at
             FROM memberships m
             JOIN users u ON u.id = m.user_id
             WHERE m.channel_id = ?1",
        )?;
        let rows = stmt.query_map(params![channel_id.to_string()], row_to_profile)?;

        let mut infos = Vec::new();
        for row in rows {
            let profile = row?;
            infos.push(ParticipantInfo {
                id: profile.id,
                display_name: profile.display_label(),
                avatar_url: profile.avatar_url.clone(),
                role: profile.role,
            });
        }
        Ok(infos)
    }

    fn last_message_preview(&self, channel_id: Uuid) -> Result<Option<MessagePreview>> {
        let preview = self
            .conn()
            .query_row(
                "SELECT sender_id, content, created_at FROM messages
                 WHERE channel_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![channel_id.to_string()],
                |row| {
                    let sender_str: String = row.get(0)?;
                    let content: Option<String> = row.get(1)?;
                    let created_str: String = row.get(2)?;
                    Ok((sender_str, content, created_str))
                },
            )
            .optional()?;

        match preview {
            None => Ok(None),
            Some((sender_str, content, created_str)) => Ok(Some(MessagePreview {
                sender_id: Uuid::parse_str(&sender_str)?,
                content,
                created_at: ts_from_sql(&created_str)?,
            })),
        }
    }

    // ------------------------------------------------------------------
    // Remove
    // ------------------------------------------------------------------

    /// Soft-remove a channel: memberships (and with them the unread state)
    /// are dropped, the message log is retained for audit.
    ///
    /// Direct channels can be removed by either party; groups only by the
    /// owner. Clears `pair_key` so the pair can start a fresh direct
    /// channel later.
    pub fn remove_channel(&self, channel_id: Uuid, caller: Uuid) -> Result<()> {
        let channel = self.require_membership(channel_id, caller)?;
        if channel.is_group {
            let membership = self.get_membership(channel_id, caller)?;
            if membership.channel_role != ChannelRole::Owner {
                return Err(StoreError::forbidden("only the owner can remove a group"));
            }
        }

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "UPDATE channels SET removed_at = ?1, pair_key = NULL WHERE id = ?2",
            params![ts_to_sql(now()), channel_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM memberships WHERE channel_id = ?1",
            params![channel_id.to_string()],
        )?;
        tx.commit()?;

        tracing::info!(channel = %channel_id, "channel removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn direct_by_pair_key(conn: &Connection, pair_key: &str) -> Result<Option<Channel>> {
    conn.query_row(
        "SELECT id, is_group, name, created_at, removed_at
         FROM channels WHERE pair_key = ?1",
        params![pair_key],
        row_to_channel,
    )
    .optional()
    .map_err(StoreError::Sqlite)
}

/// Map a `rusqlite::Row` to a [`Channel`].
fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let id_str: String = row.get(0)?;
    let is_group: bool = row.get(1)?;
    let name: Option<String> = row.get(2)?;
    let created_str: String = row.get(3)?;
    let removed_str: Option<String> = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at = ts_from_sql(&created_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let removed_at = removed_str
        .map(|s| ts_from_sql(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Channel {
        id,
        is_group,
        name,
        created_at,
        removed_at,
    })
}

/// Map a `rusqlite::Row` to a [`Membership`].
fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<Membership> {
    let channel_str: String = row.get(0)?;
    let user_str: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let last_read_str: Option<String> = row.get(3)?;
    let last_read_id_str: Option<String> = row.get(4)?;
    let unread_count: i64 = row.get(5)?;

    let channel_id = Uuid::parse_str(&channel_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let user_id = Uuid::parse_str(&user_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_read_at = last_read_str
        .map(|s| ts_from_sql(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let last_read_message_id = last_read_id_str
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Membership {
        channel_id,
        user_id,
        channel_role: ChannelRole::from_str_lossy(&role_str),
        last_read_at,
        last_read_message_id,
        unread_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_user, test_db};
    use parley_shared::Role;

    #[test]
    fn direct_channel_is_idempotent_and_symmetric() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);

        let first = db.find_or_create_direct_channel(a.id, b.id).unwrap();
        let second = db.find_or_create_direct_channel(b.id, a.id).unwrap();
        assert_eq!(first.id, second.id);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM channels", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let mut members = db.participants_unchecked(first.id).unwrap();
        members.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[test]
    fn race_loser_reuses_the_winner_row() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);
        let winner = db.find_or_create_direct_channel(a.id, b.id).unwrap();

        // Simulate the loser's INSERT OR IGNORE hitting the constraint by
        // calling again: the pair_key row already exists.
        let loser = db.find_or_create_direct_channel(a.id, b.id).unwrap();
        assert_eq!(winner.id, loser.id);
    }

    #[test]
    fn direct_channel_rejects_self_and_unknown_users() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);

        assert!(matches!(
            db.find_or_create_direct_channel(a.id, a.id),
            Err(StoreError::InvalidParticipants(_))
        ));
        assert!(matches!(
            db.find_or_create_direct_channel(a.id, Uuid::new_v4()),
            Err(StoreError::InvalidParticipants(_))
        ));
    }

    #[test]
    fn group_channel_requires_name_and_two_members() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);

        assert!(matches!(
            db.create_group_channel("  ", a.id, &[b.id]),
            Err(StoreError::InvalidParticipants(_))
        ));
        assert!(matches!(
            db.create_group_channel("Team", a.id, &[a.id]),
            Err(StoreError::InvalidParticipants(_))
        ));

        let group = db.create_group_channel("Team", a.id, &[b.id]).unwrap();
        assert!(group.is_group);
        let owner = db.get_membership(group.id, a.id).unwrap();
        assert_eq!(owner.channel_role, ChannelRole::Owner);
    }

    #[test]
    fn non_member_lookup_is_forbidden_not_empty() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);
        let outsider = new_user(&db, "X", Role::Member);
        let channel = db.find_or_create_direct_channel(a.id, b.id).unwrap();

        assert!(matches!(
            db.get_participants(channel.id, outsider.id),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.get_participants(Uuid::new_v4(), outsider.id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn conversation_list_resolves_direct_name_from_other_party() {
        let db = test_db();
        let a = new_user(&db, "Ada", Role::Member);
        let b = new_user(&db, "Grace", Role::Member);
        let channel = db.find_or_create_direct_channel(a.id, b.id).unwrap();
        db.append(channel.id, a.id, Some("hello"), Vec::new())
            .unwrap();

        let list = db.list_conversations_for_user(a.id, 10).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].display_name, "Grace");
        assert_eq!(
            list[0].last_message.as_ref().unwrap().content.as_deref(),
            Some("hello")
        );

        let other = db.list_conversations_for_user(b.id, 10).unwrap();
        assert_eq!(other[0].display_name, "Ada");
        assert_eq!(other[0].unread_count, 1);
    }

    #[test]
    fn conversation_list_orders_by_recent_activity() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);
        let c = new_user(&db, "C", Role::Member);

        let ab = db.find_or_create_direct_channel(a.id, b.id).unwrap();
        let ac = db.find_or_create_direct_channel(a.id, c.id).unwrap();
        db.append(ab.id, b.id, Some("older"), Vec::new()).unwrap();
        db.append(ac.id, c.id, Some("newer"), Vec::new()).unwrap();

        let list = db.list_conversations_for_user(a.id, 10).unwrap();
        assert_eq!(list[0].channel_id, ac.id);
        assert_eq!(list[1].channel_id, ab.id);
    }

    #[test]
    fn removed_channel_disappears_but_pair_can_restart() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);
        let channel = db.find_or_create_direct_channel(a.id, b.id).unwrap();

        db.remove_channel(channel.id, a.id).unwrap();
        assert!(db.list_conversations_for_user(a.id, 10).unwrap().is_empty());
        assert!(matches!(
            db.require_membership(channel.id, a.id),
            Err(StoreError::NotFound)
        ));

        let fresh = db.find_or_create_direct_channel(a.id, b.id).unwrap();
        assert_ne!(fresh.id, channel.id);
    }

    #[test]
    fn only_the_owner_removes_a_group() {
        let db = test_db();
        let a = new_user(&db, "A", Role::Member);
        let b = new_user(&db, "B", Role::Member);
        let group = db.create_group_channel("Team", a.id, &[b.id]).unwrap();

        assert!(matches!(
            db.remove_channel(group.id, b.id),
            Err(StoreError::Forbidden(_))
        ));
        db.remove_channel(group.id, a.id).unwrap();
    }
}
