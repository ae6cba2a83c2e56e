//! Schema migrations.
//!
//! Applied at connection open, before the `Database` handle is handed out,
//! so every typed helper can assume the full schema. `PRAGMA user_version`
//! records how far a database file has been migrated; a migration that has
//! already run is skipped.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Schema version the code expects. A new migration module bumps this.
const CURRENT_VERSION: u32 = 1;

/// Bring the connected database up to [`CURRENT_VERSION`].
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking database migrations"
    );

    if current < 1 {
        tracing::info!("applying migration v001_initial");
        v001_initial::up(conn).map_err(|e| StoreError::Migration(e.to_string()))?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    Ok(())
}
