//! Host inventory and disk-encryption signal rows.
//!
//! These tables belong to the inventory and agent services. The store only
//! reads them; the writers here exist for those collaborators and for
//! fixtures.

use rusqlite::{Connection, OptionalExtension};
use winmdm_types::host::Host;
use winmdm_types::{team_scope, TeamId};

use crate::{DbError, Result, ResultExt};

/// Insert a host and return its id.
pub fn insert(conn: &Connection, uuid: &str, team_id: TeamId, platform: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO hosts (uuid, team_id, platform) VALUES (?1, ?2, ?3)",
        rusqlite::params![uuid, team_id, platform],
    )
    .or_exists(|| format!("host {uuid}"), "inserting host")?;
    Ok(conn.last_insert_rowid())
}

/// Move a host to another team (or to no team).
pub fn set_team(conn: &Connection, host_id: i64, team_id: TeamId) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE hosts SET team_id = ?1 WHERE id = ?2",
            rusqlite::params![team_id, host_id],
        )
        .context("setting host team")?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("host {host_id}")));
    }
    Ok(())
}

/// Record MDM enrollment state for a host.
pub fn set_mdm(conn: &Connection, host_id: i64, enrolled: bool, is_server: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO host_mdm (host_id, enrolled, is_server) VALUES (?1, ?2, ?3)
         ON CONFLICT(host_id) DO UPDATE SET
             enrolled = excluded.enrolled,
             is_server = excluded.is_server",
        rusqlite::params![host_id, enrolled, is_server],
    )
    .context("upserting host mdm")?;
    Ok(())
}

/// Record the escrowed disk-encryption key state reported for a host.
pub fn set_encryption_key(
    conn: &Connection,
    host_id: i64,
    base64_encrypted: &str,
    decryptable: bool,
    client_error: &str,
    updated_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO host_disk_encryption_keys
             (host_id, base64_encrypted, decryptable, client_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(host_id) DO UPDATE SET
             base64_encrypted = excluded.base64_encrypted,
             decryptable = excluded.decryptable,
             client_error = excluded.client_error,
             updated_at = excluded.updated_at",
        rusqlite::params![
            host_id,
            base64_encrypted,
            decryptable,
            client_error,
            updated_at as i64,
        ],
    )
    .context("upserting disk encryption key")?;
    Ok(())
}

/// Record whether the host's system disk reports as encrypted.
pub fn set_disk_encrypted(
    conn: &Connection,
    host_id: i64,
    encrypted: bool,
    updated_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO host_disks (host_id, encrypted, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(host_id) DO UPDATE SET
             encrypted = excluded.encrypted,
             updated_at = excluded.updated_at",
        rusqlite::params![host_id, encrypted, updated_at as i64],
    )
    .context("upserting host disk")?;
    Ok(())
}

/// Get a host by UUID.
pub fn get_by_uuid(conn: &Connection, uuid: &str) -> Result<Host> {
    conn.query_row(
        "SELECT h.id, h.uuid, h.team_id, h.platform, COALESCE(hm.is_server, 0)
         FROM hosts h LEFT JOIN host_mdm hm ON hm.host_id = h.id
         WHERE h.uuid = ?1",
        [uuid],
        |row| {
            Ok(Host {
                id: row.get(0)?,
                uuid: row.get(1)?,
                team_id: row.get(2)?,
                platform: row.get(3)?,
                is_server: row.get(4)?,
            })
        },
    )
    .optional()
    .context("get host")?
    .ok_or_else(|| DbError::NotFound(format!("host {uuid}")))
}

/// Host UUIDs in a team scope (team 0 and NULL are both "no team").
pub fn uuids_in_team(conn: &Connection, team_id: TeamId) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT uuid FROM hosts WHERE COALESCE(team_id, 0) = ?1 ORDER BY uuid")
        .context("prepare team hosts")?;
    let rows = stmt
        .query_map([team_scope(team_id)], |row| row.get(0))
        .context("query team hosts")?
        .collect::<std::result::Result<Vec<String>, _>>()
        .context("read team hosts")?;
    Ok(rows)
}
