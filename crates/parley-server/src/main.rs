//! # parley-server
//!
//! Messaging backend for the Parley workspace application.
//!
//! This binary provides:
//! - **Channel store** for direct and group conversations with
//!   per-participant read cursors and unread counters
//! - **Append-only message log** with backward-paginated backfill
//! - **Notification fan-out** (one row per recipient, post-commit,
//!   retry-safe) and **role broadcasts** resolved at read time
//! - **Real-time dispatch** of committed rows to live subscribers over
//!   Server-Sent Events, keyed by channel or by user
//! - **REST API** (axum) for sends, backfill, read acknowledgement, and
//!   notification management

mod api;
mod auth;
mod config;
mod dispatch;
mod error;
mod fanout;
mod service;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::service::ChatService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Arc::new(Mutex::new(Database::open_at(&config.database_path)?));

    // Directory sync over HTTP is admin-only, so a fresh database needs its
    // first admin seeded here before any request can authenticate.
    if let Some(admin_id) = config.bootstrap_admin_id {
        let db = db.lock().await;
        if !db.user_exists(admin_id)? {
            db.upsert_user(&parley_shared::UserProfile {
                id: admin_id,
                display_name: Some("Admin".to_string()),
                full_name: None,
                handle: None,
                avatar_url: None,
                role: parley_shared::Role::Admin,
                created_at: chrono::SubsecRound::trunc_subsecs(chrono::Utc::now(), 6),
            })?;
            info!(user = %admin_id, "Seeded bootstrap admin");
        }
    }

    let dispatcher = Dispatcher::new(config.dispatch_buffer);

    let service = ChatService::new(db.clone(), dispatcher.clone(), config.fanout_max_retries);

    let app_state = AppState {
        db,
        dispatcher: dispatcher.clone(),
        service,
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic sweep of subscription entries whose consumers vanished
    // without an intervening publish (every 5 minutes).
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            dispatcher.purge_idle().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // tokio::select! ensures that if either the HTTP server or a shutdown
    // signal arrives, we exit cleanly.
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
