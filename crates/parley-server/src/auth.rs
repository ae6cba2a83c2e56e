//! Caller identity resolution.
//!
//! Authentication itself is an external collaborator: requests arrive from
//! an upstream authenticating proxy that sets `x-user-id` after verifying
//! the session. This extractor resolves that id against the directory
//! mirror, yielding the caller's stable id and role. No header, an
//! unparsable id, or an id the directory has never seen all reject with
//! `Unauthorized`; a store failure during resolution is retryable
//! (`DependencyUnavailable`).

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use parley_shared::Role;
use parley_store::StoreError;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The resolved caller: precondition of every operation.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or(ApiError::Unauthorized)?;
        let user_id = header
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or(ApiError::Unauthorized)?;

        let profile = {
            let db = state.db.lock().await;
            db.get_user(user_id)
        };

        match profile {
            Ok(profile) => Ok(Identity {
                user_id: profile.id,
                role: profile.role,
            }),
            Err(StoreError::NotFound) => Err(ApiError::Unauthorized),
            Err(e) => Err(ApiError::DependencyUnavailable(e.to_string())),
        }
    }
}
