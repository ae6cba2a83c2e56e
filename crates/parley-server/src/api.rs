use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{SubsecRound, Utc};
use futures::{Stream, StreamExt};
use parley_shared::{Role, RoleSet, SubjectKey, UserProfile};
use parley_store::{Attachment, ConversationSummary, Database, Message, Notification};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::auth::Identity;
use crate::dispatch::Dispatcher;
use crate::error::ApiError;
use crate::service::ChatService;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub dispatcher: Dispatcher,
    pub service: ChatService,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/users", post(upsert_user))
        .route("/channels/direct", post(direct_channel))
        .route("/channels/group", post(group_channel))
        .route("/channels/:id", delete(remove_channel))
        .route("/channels/:id/messages", post(send_message))
        .route("/channels/:id/messages", get(list_messages))
        .route("/channels/:id/read", post(mark_read))
        .route("/conversations", get(list_conversations))
        .route("/messages/:id", patch(edit_message))
        .route("/messages/:id", delete(delete_message))
        .route("/notifications", get(list_notifications))
        .route("/notifications/read", post(mark_notifications_read))
        .route("/notifications/broadcast", post(broadcast))
        .route("/subscribe/:subject", get(subscribe))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct UpsertUserRequest {
    id: Uuid,
    display_name: Option<String>,
    full_name: Option<String>,
    handle: Option<String>,
    avatar_url: Option<String>,
    role: Role,
}

#[derive(Deserialize)]
struct DirectChannelRequest {
    other_user: Uuid,
}

#[derive(Deserialize)]
struct GroupChannelRequest {
    name: String,
    members: Vec<Uuid>,
}

#[derive(Serialize)]
struct ChannelResponse {
    id: Uuid,
    is_group: bool,
    name: Option<String>,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    content: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    before: Option<Uuid>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct EditMessageRequest {
    content: String,
}

#[derive(Deserialize)]
struct MarkNotificationsReadRequest {
    ids: Vec<Uuid>,
}

#[derive(Serialize)]
struct MarkedReadResponse {
    updated: usize,
}

#[derive(Deserialize)]
struct BroadcastRequest {
    title: String,
    content: Option<String>,
    role_flags: RoleSet,
    image_url: Option<String>,
    action_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Directory sync from the identity provider. Admin-only.
async fn upsert_user(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<UpsertUserRequest>,
) -> Result<StatusCode, ApiError> {
    if !identity.is_admin() {
        return Err(ApiError::Forbidden(
            "only admins can sync directory entries".into(),
        ));
    }

    let profile = UserProfile {
        id: req.id,
        display_name: req.display_name,
        full_name: req.full_name,
        handle: req.handle,
        avatar_url: req.avatar_url,
        role: req.role,
        // Microsecond precision, matching what the store persists.
        created_at: Utc::now().trunc_subsecs(6),
    };

    let db = state.db.lock().await;
    db.upsert_user(&profile)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn direct_channel(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<DirectChannelRequest>,
) -> Result<(StatusCode, Json<ChannelResponse>), ApiError> {
    let channel = {
        let db = state.db.lock().await;
        db.find_or_create_direct_channel(identity.user_id, req.other_user)?
    };
    Ok((
        StatusCode::OK,
        Json(ChannelResponse {
            id: channel.id,
            is_group: channel.is_group,
            name: channel.name,
        }),
    ))
}

async fn group_channel(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<GroupChannelRequest>,
) -> Result<(StatusCode, Json<ChannelResponse>), ApiError> {
    let channel = {
        let db = state.db.lock().await;
        db.create_group_channel(&req.name, identity.user_id, &req.members)?
    };
    Ok((
        StatusCode::CREATED,
        Json(ChannelResponse {
            id: channel.id,
            is_group: channel.is_group,
            name: channel.name,
        }),
    ))
}

async fn remove_channel(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.lock().await;
    db.remove_channel(id, identity.user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Send a message. Responds as soon as the message is durable and
/// published live; notification fan-out continues in the background and
/// never turns this success into a failure.
async fn send_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(channel_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let message = state
        .service
        .send_message(channel_id, identity.user_id, req.content, req.attachments)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_messages(
    State(state): State<AppState>,
    identity: Identity,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let db = state.db.lock().await;
    let page = db.list_range(channel_id, identity.user_id, query.before, limit)?;
    Ok(Json(page))
}

async fn list_conversations(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let db = state.db.lock().await;
    let summaries = db.list_conversations_for_user(identity.user_id, limit)?;
    Ok(Json(summaries))
}

async fn mark_read(
    State(state): State<AppState>,
    identity: Identity,
    Path(channel_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.lock().await;
    db.mark_read(channel_id, identity.user_id, identity.role, identity.user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn edit_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let db = state.db.lock().await;
    let message = db.mark_edited(message_id, identity.user_id, &req.content)?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.lock().await;
    db.soft_delete_message(message_id, identity.user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_notifications(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let db = state.db.lock().await;
    let notifications =
        db.list_notifications_for_viewer(identity.user_id, identity.role, limit)?;
    Ok(Json(notifications))
}

async fn mark_notifications_read(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<MarkNotificationsReadRequest>,
) -> Result<Json<MarkedReadResponse>, ApiError> {
    let db = state.db.lock().await;
    let updated = db.mark_notifications_read(&req.ids, identity.user_id)?;
    Ok(Json(MarkedReadResponse { updated }))
}

/// Administrative role broadcast.
async fn broadcast(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<BroadcastRequest>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    if !identity.is_admin() {
        return Err(ApiError::Forbidden("only admins can broadcast".into()));
    }

    let notification = state
        .service
        .broadcast(
            &req.title,
            req.content.as_deref(),
            req.role_flags,
            req.image_url.as_deref(),
            req.action_url.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(notification)))
}

/// Live event stream for one subject key, as Server-Sent Events.
///
/// A `user:{id}` key belongs to its user alone (admins may observe any);
/// a `channel:{id}` key requires membership. The subscription's filter is
/// unregistered when the client disconnects and the stream drops.
async fn subscribe(
    State(state): State<AppState>,
    identity: Identity,
    Path(subject): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let key: SubjectKey = subject
        .parse()
        .map_err(|e: parley_shared::SubjectKeyError| ApiError::BadRequest(e.to_string()))?;

    match key {
        SubjectKey::User(user_id) => {
            if user_id != identity.user_id && !identity.is_admin() {
                return Err(ApiError::Forbidden(
                    "cannot subscribe to another user's notifications".into(),
                ));
            }
        }
        SubjectKey::Channel(channel_id) => {
            let db = state.db.lock().await;
            db.require_membership(channel_id, identity.user_id)?;
        }
    }

    let subscription = state.dispatcher.subscribe(key).await;
    info!(subject = %key, user = %identity.user_id, "live subscription opened");

    let stream = subscription.map(|event| {
        let sse = SseEvent::default()
            .id(event.row_id().to_string())
            .json_data(&event)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "failed to encode live event");
                SseEvent::default().comment("encoding error")
            });
        Ok(sse)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
