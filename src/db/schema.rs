//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    ).map_err(|e| StorageError::db("Failed to create schema_version table", e))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StorageError::db("Failed to clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StorageError::db("Failed to set schema_version", e))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(LINK_SCHEMA)
        .map_err(|e| StorageError::db("Failed to create link tables", e))?;

    conn.execute_batch(PERFORMANCE_SCHEMA)
        .map_err(|e| StorageError::db("Failed to create performance tables", e))?;

    Ok(())
}

/// Verification codes and links
const LINK_SCHEMA: &str = r#"
-- One row per issued code. The verified row is the current link; a later
-- redemption touching either side moves it to 'superseded'.
CREATE TABLE IF NOT EXISTS link_codes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform_user_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending' CHECK (state IN ('pending', 'verified', 'superseded')),
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    external_user_id TEXT,
    external_username TEXT,
    verified_at INTEGER
);

-- A pending code value is globally unique
CREATE UNIQUE INDEX IF NOT EXISTS idx_link_codes_pending_code
    ON link_codes(code) WHERE state = 'pending';

-- At most one pending code per platform user
CREATE UNIQUE INDEX IF NOT EXISTS idx_link_codes_pending_user
    ON link_codes(platform_user_id) WHERE state = 'pending';

-- Hot path: link lookup on every quiz submission
CREATE INDEX IF NOT EXISTS idx_link_codes_platform_user
    ON link_codes(platform_user_id, state, verified_at);

-- Links are one-to-one: at most one current link per side
CREATE UNIQUE INDEX IF NOT EXISTS idx_link_codes_current_platform_user
    ON link_codes(platform_user_id) WHERE state = 'verified';

CREATE UNIQUE INDEX IF NOT EXISTS idx_link_codes_current_external_user
    ON link_codes(external_user_id) WHERE state = 'verified';

CREATE INDEX IF NOT EXISTS idx_link_codes_expiry
    ON link_codes(expires_at) WHERE state = 'pending';
"#;

/// Per-topic aggregates
const PERFORMANCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS topic_performance (
    external_user_id TEXT NOT NULL,
    topic_name TEXT NOT NULL,
    total_questions INTEGER NOT NULL DEFAULT 0 CHECK (total_questions >= 0),
    correct_answers INTEGER NOT NULL DEFAULT 0 CHECK (correct_answers >= 0),
    incorrect_answers INTEGER NOT NULL DEFAULT 0 CHECK (incorrect_answers >= 0),
    accuracy REAL NOT NULL DEFAULT 0,
    last_activity_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (external_user_id, topic_name)
);

CREATE INDEX IF NOT EXISTS idx_topic_performance_accuracy
    ON topic_performance(external_user_id, accuracy);
"#;
