//! Schema migrations.
//!
//! The applied version lives in `PRAGMA user_version`; 0 means an empty
//! database. Steps only go forward.

use std::cmp::Ordering;

use rusqlite::Connection;

use crate::{schema, DbError, Result, SCHEMA_VERSION};

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn run(conn: &Connection) -> Result<()> {
    let current = user_version(conn)?;
    match current.cmp(&SCHEMA_VERSION) {
        Ordering::Equal => Ok(()),
        Ordering::Greater => Err(DbError::Migration(format!(
            "database schema v{current} is newer than supported v{SCHEMA_VERSION}"
        ))),
        Ordering::Less if current == 0 => initialize(conn),
        Ordering::Less => upgrade(conn, current),
    }
}

fn user_version(conn: &Connection) -> Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(DbError::Sqlite)
}

fn set_user_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)
        .map_err(DbError::Sqlite)
}

fn initialize(conn: &Connection) -> Result<()> {
    tracing::info!(version = SCHEMA_VERSION, "creating database schema");
    conn.execute_batch(schema::SCHEMA_V1)
        .map_err(DbError::Sqlite)?;
    // Disk encryption starts disabled for the no-team scope.
    conn.execute(
        "INSERT OR IGNORE INTO disk_encryption_settings (team_id, enabled) VALUES (0, 0)",
        [],
    )
    .map_err(DbError::Sqlite)?;
    set_user_version(conn, SCHEMA_VERSION)
}

fn upgrade(conn: &Connection, from: u32) -> Result<()> {
    for version in (from + 1)..=SCHEMA_VERSION {
        let Some(sql) = step(version) else {
            return Err(DbError::Migration(format!("no migration to schema v{version}")));
        };
        tracing::info!(version, "migrating database schema");
        conn.execute_batch(sql).map_err(DbError::Sqlite)?;
        set_user_version(conn, version)?;
    }
    Ok(())
}

/// SQL that moves the schema from `version - 1` to `version`, for every
/// version after the first.
const STEPS: &[(u32, &str)] = &[];

fn step(version: u32) -> Option<&'static str> {
    STEPS
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, sql)| *sql)
}
