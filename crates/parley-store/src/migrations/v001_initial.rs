//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `users`, `channels`, `memberships`,
//! `messages`, and `notifications`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (read mirror of the external identity directory)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID
    display_name TEXT,
    full_name    TEXT,
    handle       TEXT,                        -- contact handle, e.g. email
    avatar_url   TEXT,
    role         TEXT NOT NULL,               -- admin|coordinator|member|unassigned
    created_at   TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    is_group   INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    name       TEXT,                          -- required for groups
    pair_key   TEXT UNIQUE,                   -- "{lo}:{hi}" of the member ids
                                              -- for direct channels; the
                                              -- find-or-create race guard
    created_at TEXT NOT NULL,
    removed_at TEXT                           -- soft removal
);

-- ----------------------------------------------------------------
-- Memberships (per-user channel state, incl. the read cursor)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS memberships (
    channel_id   TEXT NOT NULL,               -- FK -> channels(id)
    user_id      TEXT NOT NULL,               -- FK -> users(id)
    channel_role TEXT NOT NULL DEFAULT 'member',  -- member|owner
    last_read_at TEXT,
    last_read_message_id TEXT,                    -- exact read cursor tie-break
    unread_count INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (channel_id, user_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id);

-- ----------------------------------------------------------------
-- Messages (append-only log; no cascade from channels: audit retention)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    channel_id  TEXT NOT NULL,
    sender_id   TEXT NOT NULL,
    content     TEXT,                         -- nullable when attachment-only
    attachments TEXT,                         -- JSON array of {url,mime,size}
    is_edited   INTEGER NOT NULL DEFAULT 0,
    deleted_at  TEXT,                         -- soft delete
    created_at  TEXT NOT NULL
);

-- (channel, created_at, id) is the total order every reader relies on.
CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
    ON messages(channel_id, created_at, id);

-- ----------------------------------------------------------------
-- Notifications (direct fan-out rows and role-broadcast rows)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS notifications (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    sender_id       TEXT,
    receiver_id     TEXT,                       -- NULL for role broadcasts
    message_id      TEXT,                       -- set by message fan-out
    title           TEXT NOT NULL,
    content         TEXT,
    image_url       TEXT,
    action_url      TEXT,
    for_admin       INTEGER NOT NULL DEFAULT 0,
    for_coordinator INTEGER NOT NULL DEFAULT 0,
    for_member      INTEGER NOT NULL DEFAULT 0,
    is_read         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_receiver
    ON notifications(receiver_id, created_at);

-- Fan-out dedup key: re-running the fan-out for a message can never
-- materialize a second notification for the same recipient.
CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_message_receiver
    ON notifications(message_id, receiver_id)
    WHERE message_id IS NOT NULL;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
