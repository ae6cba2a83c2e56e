//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the
//! HTTP layer.

use chrono::{DateTime, Utc};
use parley_shared::{Role, RoleSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A conversation channel (direct message or group).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    /// Unique channel identifier.
    pub id: Uuid,
    /// Group channel vs. two-party direct message.
    pub is_group: bool,
    /// Explicit display name. Always set for groups; `None` for direct
    /// channels, whose name is derived from the other participant.
    pub name: Option<String>,
    /// When the channel was created.
    pub created_at: DateTime<Utc>,
    /// Soft-removal timestamp. A removed channel is invisible to every
    /// listing, but its message log is retained.
    pub removed_at: Option<DateTime<Utc>>,
}

/// Role of a user within one channel. Groups distinguish the owner; direct
/// channels treat both parties as plain members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Member,
    Owner,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Member => "member",
            ChannelRole::Owner => "owner",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "owner" => ChannelRole::Owner,
            _ => ChannelRole::Member,
        }
    }
}

/// Per-user channel state: the read cursor and the denormalized unread
/// counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub channel_role: ChannelRole,
    /// Read cursor: timestamp of the newest message the user has read.
    pub last_read_at: Option<DateTime<Utc>>,
    /// Read cursor tie-break: id of that message, for channels where two
    /// messages share a timestamp.
    pub last_read_message_id: Option<Uuid>,
    pub unread_count: i64,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single file attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
    pub size: i64,
}

/// A single chat message. Immutable once appended, except for content edits
/// (which flip `is_edited`) and soft deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: Uuid,
    /// The channel this message belongs to.
    pub channel_id: Uuid,
    /// The author.
    pub sender_id: Uuid,
    /// Text content. `None` for attachment-only messages.
    pub content: Option<String>,
    /// Ordered attachment list.
    pub attachments: Vec<Attachment>,
    pub is_edited: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// When the message was sent. Together with `id` this forms the total
    /// order of the channel's log.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// A notification row.
///
/// Exactly one addressing mode is populated: either `receiver_id` (direct
/// fan-out, one row per recipient) or a non-empty `role_flags` set (one row
/// visible to every current holder of those roles).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub sender_id: Option<Uuid>,
    pub receiver_id: Option<Uuid>,
    /// For message fan-out rows, the originating message. Part of the
    /// dedup key that makes fan-out retries safe.
    pub message_id: Option<Uuid>,
    pub title: String,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub action_url: Option<String>,
    pub role_flags: RoleSet,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation list projection
// ---------------------------------------------------------------------------

/// Minimal display metadata for a channel participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
}

/// The most recent message of a channel, as shown in the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePreview {
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of the caller's conversation list: a denormalized, read-heavy
/// projection refreshed per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub channel_id: Uuid,
    pub is_group: bool,
    /// Explicit name for groups; the other participant's display label for
    /// direct channels.
    pub display_name: String,
    pub last_message: Option<MessagePreview>,
    pub unread_count: i64,
    pub participants: Vec<ParticipantInfo>,
}
