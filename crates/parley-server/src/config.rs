//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Per-subscriber buffered event capacity. A subscriber that falls
    /// further behind than this has events dropped and must reconcile via
    /// backfill.
    /// Env: `DISPATCH_BUFFER`
    /// Default: `256`
    pub dispatch_buffer: usize,

    /// How many times a failed notification fan-out batch is retried
    /// before giving up (the send itself is never affected).
    /// Env: `FANOUT_MAX_RETRIES`
    /// Default: `2`
    pub fanout_max_retries: u32,

    /// Optional user id to seed as the first admin at startup. Directory
    /// sync over HTTP is admin-only, so an empty database needs one entry
    /// created out-of-band before the API is usable.
    /// Env: `BOOTSTRAP_ADMIN_ID`
    /// Default: none
    pub bootstrap_admin_id: Option<uuid::Uuid>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./parley.db"),
            dispatch_buffer: 256,
            fanout_max_retries: 2,
            bootstrap_admin_id: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("DISPATCH_BUFFER") {
            if let Ok(n) = val.parse::<usize>() {
                if n > 0 {
                    config.dispatch_buffer = n;
                }
            }
        }

        if let Ok(val) = std::env::var("FANOUT_MAX_RETRIES") {
            if let Ok(n) = val.parse::<u32>() {
                config.fanout_max_retries = n;
            }
        }

        if let Ok(val) = std::env::var("BOOTSTRAP_ADMIN_ID") {
            match val.trim().parse::<uuid::Uuid>() {
                Ok(id) => config.bootstrap_admin_id = Some(id),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid BOOTSTRAP_ADMIN_ID, ignoring");
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
