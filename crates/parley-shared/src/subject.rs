//! Real-time subscription keys.
//!
//! A subscriber registers interest in either a channel's message inserts
//! (`channel:{id}`) or a user's notification inserts (`user:{id}`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A key identifying one real-time delivery stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKey {
    /// Message inserts for one channel.
    Channel(Uuid),
    /// Notification inserts addressed to one user.
    User(Uuid),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubjectKeyError {
    #[error("subject key must look like `channel:{{uuid}}` or `user:{{uuid}}`, got `{0}`")]
    Malformed(String),
    #[error("unknown subject kind `{0}`")]
    UnknownKind(String),
    #[error("invalid id in subject key: {0}")]
    InvalidId(#[from] uuid::Error),
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKey::Channel(id) => write!(f, "channel:{id}"),
            SubjectKey::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for SubjectKey {
    type Err = SubjectKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| SubjectKeyError::Malformed(s.to_string()))?;
        let id = Uuid::parse_str(id)?;
        match kind {
            "channel" => Ok(SubjectKey::Channel(id)),
            "user" => Ok(SubjectKey::User(id)),
            other => Err(SubjectKeyError::UnknownKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let id = Uuid::new_v4();
        for key in [SubjectKey::Channel(id), SubjectKey::User(id)] {
            assert_eq!(key.to_string().parse::<SubjectKey>().unwrap(), key);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            "nope".parse::<SubjectKey>(),
            Err(SubjectKeyError::Malformed(_))
        ));
        assert!(matches!(
            format!("room:{}", Uuid::new_v4()).parse::<SubjectKey>(),
            Err(SubjectKeyError::UnknownKind(_))
        ));
        assert!(matches!(
            "channel:not-a-uuid".parse::<SubjectKey>(),
            Err(SubjectKeyError::InvalidId(_))
        ));
    }
}
