//! Configuration profile catalog and reconciler.
//!
//! The desired set is every (profile, host) pair where the profile's team
//! matches the host's team (NULL host team = team 0), the host is a Windows
//! host, and the host has an enrollment. The actual set is the
//! `host_mdm_profiles` table. Every pair in the union of the two falls into
//! exactly one of: the install set, the remove set, or "desired and already
//! handled" (no write).

use std::collections::{HashMap, HashSet};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use winmdm_types::profile::{
    ConfigProfile, HostProfilePayload, HostProfileView, OperationType, ProfileStatus,
};
use winmdm_types::{team_scope, TeamId, PLATFORM_WINDOWS};

use crate::batch::{opt_text, placeholders, text, Batch};
use crate::tx::with_retry_tx;
use crate::{now_secs, parse_column, CancelToken, DbError, Result, ResultExt, StoreConfig};

// ---- Catalog ----

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<ConfigProfile> {
    let team: u32 = row.get(1)?;
    Ok(ConfigProfile {
        profile_uuid: row.get(0)?,
        team_id: (team != 0).then_some(team),
        name: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get::<_, i64>(4)? as u64,
        updated_at: row.get::<_, i64>(5)? as u64,
    })
}

/// Create a profile with a fresh UUID. Names are unique per team.
pub fn create(
    conn: &Connection,
    team_id: TeamId,
    name: &str,
    content: &[u8],
) -> Result<ConfigProfile> {
    if name.is_empty() {
        return Err(DbError::InvalidInput("profile name is empty".into()));
    }
    let profile_uuid = uuid::Uuid::new_v4().to_string();
    insert_profile(conn, &profile_uuid, team_scope(team_id), name, content)?;
    get(conn, &profile_uuid)
}

fn insert_profile(
    conn: &Connection,
    profile_uuid: &str,
    team: u32,
    name: &str,
    content: &[u8],
) -> Result<()> {
    let now = now_secs();
    conn.execute(
        "INSERT INTO mdm_configuration_profiles
             (profile_uuid, team_id, name, content, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        rusqlite::params![profile_uuid, team, name, content, now],
    )
    .or_exists(
        || format!("profile named {name:?} in team {team}"),
        "inserting profile",
    )?;
    Ok(())
}

/// Get a profile by UUID.
pub fn get(conn: &Connection, profile_uuid: &str) -> Result<ConfigProfile> {
    conn.query_row(
        "SELECT profile_uuid, team_id, name, content, created_at, updated_at
         FROM mdm_configuration_profiles WHERE profile_uuid = ?1",
        [profile_uuid],
        profile_from_row,
    )
    .optional()
    .context("get profile")?
    .ok_or_else(|| DbError::NotFound(format!("profile {profile_uuid}")))
}

/// Profiles in a team scope, ordered by name.
pub fn list(conn: &Connection, team_id: TeamId) -> Result<Vec<ConfigProfile>> {
    let mut stmt = conn
        .prepare(
            "SELECT profile_uuid, team_id, name, content, created_at, updated_at
             FROM mdm_configuration_profiles WHERE team_id = ?1 ORDER BY name",
        )
        .context("prepare list profiles")?;
    let profiles = stmt
        .query_map([team_scope(team_id)], profile_from_row)
        .context("query profiles")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("read profiles")?;
    Ok(profiles)
}

/// Delete a profile. Its host rows stay until reconciliation removes them.
pub fn delete(conn: &Connection, profile_uuid: &str) -> Result<()> {
    let deleted = conn
        .execute(
            "DELETE FROM mdm_configuration_profiles WHERE profile_uuid = ?1",
            [profile_uuid],
        )
        .context("deleting profile")?;
    if deleted != 1 {
        return Err(DbError::NotFound(format!("profile {profile_uuid}")));
    }
    Ok(())
}

/// Replace a profile's content. If it changed, every install row for the
/// profile goes back to not-dispatched.
pub fn update_content(
    conn: &Connection,
    config: &StoreConfig,
    cancel: &CancelToken,
    profile_uuid: &str,
    content: &[u8],
) -> Result<()> {
    with_retry_tx(conn, &config.retry_policy(), cancel, |tx| {
        let current = get(tx, profile_uuid)?;
        if current.content != content {
            write_content(tx, profile_uuid, content)?;
        }
        Ok(())
    })
}

fn write_content(conn: &Connection, profile_uuid: &str, content: &[u8]) -> Result<()> {
    conn.execute(
        "UPDATE mdm_configuration_profiles SET content = ?1, updated_at = ?2
         WHERE profile_uuid = ?3",
        rusqlite::params![content, now_secs(), profile_uuid],
    )
    .context("updating profile content")?;
    let reset = conn
        .execute(
            "UPDATE host_mdm_profiles SET status = NULL, detail = '', command_uuid = ''
             WHERE profile_uuid = ?1 AND operation_type = 'install'",
            [profile_uuid],
        )
        .context("resetting host profiles")?;
    tracing::debug!(profile_uuid, hosts = reset, "profile content changed");
    Ok(())
}

/// Make `profiles` the complete set for a team, matched by name.
///
/// Names not in `profiles` are deleted, new names are created, and edited
/// content is written (resetting install rows as in [`update_content`]).
/// Unchanged profiles keep their UUID and host rows. Only `name` and
/// `content` of each input are used.
pub fn batch_set(
    conn: &Connection,
    config: &StoreConfig,
    cancel: &CancelToken,
    team_id: TeamId,
    profiles: &[ConfigProfile],
) -> Result<()> {
    let mut seen = HashSet::with_capacity(profiles.len());
    for p in profiles {
        if p.name.is_empty() {
            return Err(DbError::InvalidInput("profile name is empty".into()));
        }
        if !seen.insert(p.name.as_str()) {
            return Err(DbError::InvalidInput(format!(
                "duplicate profile name {:?}",
                p.name
            )));
        }
    }
    let team = team_scope(team_id);

    with_retry_tx(conn, &config.retry_policy(), cancel, |tx| {
        let existing: HashMap<String, ConfigProfile> = list(tx, team_id)?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        for (name, old) in &existing {
            if !seen.contains(name.as_str()) {
                delete(tx, &old.profile_uuid)?;
            }
        }

        for p in profiles {
            match existing.get(&p.name) {
                Some(old) if old.content != p.content => {
                    write_content(tx, &old.profile_uuid, &p.content)?
                }
                Some(_) => {}
                None => {
                    let profile_uuid = uuid::Uuid::new_v4().to_string();
                    insert_profile(tx, &profile_uuid, team, &p.name, &p.content)?;
                }
            }
        }
        Ok(())
    })
}

/// Content of each requested profile, keyed by UUID. Unknown UUIDs are
/// absent from the map.
pub fn get_contents(conn: &Connection, profile_uuids: &[String]) -> Result<HashMap<String, Vec<u8>>> {
    if profile_uuids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT profile_uuid, content FROM mdm_configuration_profiles
         WHERE profile_uuid IN ({})",
        placeholders(profile_uuids.len())
    );
    let mut stmt = conn.prepare(&sql).context("prepare profile contents")?;
    let contents = stmt
        .query_map(params_from_iter(profile_uuids), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .context("query profile contents")?
        .collect::<std::result::Result<HashMap<_, _>, _>>()
        .context("read profile contents")?;
    Ok(contents)
}

// ---- Reconciler ----

/// Rows written and deleted by [`apply_pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub upserted: usize,
    pub deleted: usize,
}

const PAYLOAD_COLUMNS: &str =
    "profile_uuid, host_uuid, profile_name, operation_type, status, detail, command_uuid";

pub(crate) fn payload_from_row(row: &Row<'_>) -> rusqlite::Result<HostProfilePayload> {
    let operation_type = row
        .get::<_, Option<String>>(3)?
        .map(|s| parse_column(3, s.parse::<OperationType>()))
        .transpose()?;
    let status = parse_column(4, ProfileStatus::from_column(row.get::<_, Option<String>>(4)?.as_deref()))?;
    Ok(HostProfilePayload {
        profile_uuid: row.get(0)?,
        host_uuid: row.get(1)?,
        profile_name: row.get(2)?,
        operation_type,
        status,
        detail: row.get(5)?,
        command_uuid: row.get(6)?,
    })
}

/// `WITH desired AS (...)`, binding its parameters into `params`.
fn desired_cte(hosts: Option<&[String]>, params: &mut Vec<Value>) -> String {
    params.push(text(PLATFORM_WINDOWS));
    let host_filter = match hosts {
        Some(hosts) => {
            params.extend(hosts.iter().map(text));
            format!("AND h.uuid IN ({})", placeholders(hosts.len()))
        }
        None => String::new(),
    };
    format!(
        "WITH desired AS (
             SELECT p.profile_uuid, p.name AS profile_name, h.uuid AS host_uuid
             FROM mdm_configuration_profiles p
             JOIN hosts h ON COALESCE(h.team_id, 0) = p.team_id
             WHERE h.platform = ?
               AND EXISTS (SELECT 1 FROM mdm_enrollments e WHERE e.host_uuid = h.uuid)
               {host_filter}
         )"
    )
}

fn query_payloads(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<HostProfilePayload>> {
    let mut stmt = conn.prepare(sql).context("prepare host profiles")?;
    let rows = stmt
        .query_map(params_from_iter(params), payload_from_row)
        .context("query host profiles")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("read host profiles")?;
    Ok(rows)
}

/// Desired pairs with no host row, plus desired pairs whose row is waiting
/// for (re)dispatch: an install row with no status, or a leftover remove
/// row for a pair that is desired again.
///
/// `hosts` restricts the result to those host UUIDs; `None` means all.
pub fn compute_install_set(
    conn: &Connection,
    hosts: Option<&[String]>,
) -> Result<Vec<HostProfilePayload>> {
    if hosts.is_some_and(<[String]>::is_empty) {
        return Ok(Vec::new());
    }
    let mut params = Vec::new();
    let sql = format!(
        "{desired}
         SELECT d.profile_uuid, d.host_uuid, d.profile_name, hp.operation_type,
                hp.status, COALESCE(hp.detail, ''), COALESCE(hp.command_uuid, '')
         FROM desired d
         LEFT JOIN host_mdm_profiles hp
             ON hp.profile_uuid = d.profile_uuid AND hp.host_uuid = d.host_uuid
         WHERE hp.profile_uuid IS NULL
            OR (hp.operation_type IS NOT 'remove' AND hp.status IS NULL)
            OR hp.operation_type = 'remove'
         ORDER BY d.host_uuid, d.profile_uuid",
        desired = desired_cte(hosts, &mut params),
    );
    query_payloads(conn, &sql, &params)
}

/// Host rows whose pair is not in the desired set.
pub fn compute_remove_set(
    conn: &Connection,
    hosts: Option<&[String]>,
) -> Result<Vec<HostProfilePayload>> {
    if hosts.is_some_and(<[String]>::is_empty) {
        return Ok(Vec::new());
    }
    let mut params = Vec::new();
    let desired = desired_cte(hosts, &mut params);
    let host_filter = match hosts {
        Some(hosts) => {
            params.extend(hosts.iter().map(text));
            format!("AND hp.host_uuid IN ({})", placeholders(hosts.len()))
        }
        None => String::new(),
    };
    let sql = format!(
        "{desired}
         SELECT {PAYLOAD_COLUMNS}
         FROM host_mdm_profiles hp
         WHERE NOT EXISTS (
             SELECT 1 FROM desired d
             WHERE d.profile_uuid = hp.profile_uuid AND d.host_uuid = hp.host_uuid
         )
         {host_filter}
         ORDER BY hp.host_uuid, hp.profile_uuid"
    );
    query_payloads(conn, &sql, &params)
}

/// Converge the host rows for `hosts` (`None` = every host) in one unit of
/// work: delete the remove set, then write the install set as
/// not-dispatched installs with detail and command cleared.
///
/// Running it again with unchanged inputs writes the same rows.
pub fn apply_pending(
    conn: &Connection,
    config: &StoreConfig,
    cancel: &CancelToken,
    hosts: Option<&[String]>,
) -> Result<Reconciled> {
    if hosts.is_some_and(<[String]>::is_empty) {
        return Ok(Reconciled::default());
    }
    with_retry_tx(conn, &config.retry_policy(), cancel, |tx| {
        let removals = compute_remove_set(tx, hosts)?;
        let deleted = delete_rows(tx, &removals, config.batch.delete_batch_size, cancel)?;

        let installs: Vec<HostProfilePayload> = compute_install_set(tx, hosts)?
            .into_iter()
            .map(|p| HostProfilePayload {
                operation_type: Some(OperationType::Install),
                status: ProfileStatus::NotDispatched,
                detail: String::new(),
                command_uuid: String::new(),
                ..p
            })
            .collect();
        let upserted = upsert_rows(tx, &installs, config.batch.upsert_batch_size, cancel)?;

        tracing::debug!(upserted, deleted, "applied pending host profiles");
        Ok(Reconciled { upserted, deleted })
    })
}

/// Upsert host rows, one unit of work per batch of
/// `batch.upsert_batch_size` rows.
///
/// A failure leaves earlier batches committed; re-running the call is safe.
pub fn bulk_upsert_status(
    conn: &Connection,
    config: &StoreConfig,
    cancel: &CancelToken,
    rows: &[HostProfilePayload],
) -> Result<usize> {
    let policy = config.retry_policy();
    let mut written = 0;
    for chunk in rows.chunks(config.batch.upsert_batch_size.max(1)) {
        written += with_retry_tx(conn, &policy, cancel, |tx| {
            upsert_rows(tx, chunk, chunk.len(), cancel)
        })?;
    }
    Ok(written)
}

/// Delete host rows by (profile, host), one unit of work per batch of
/// `batch.delete_batch_size` rows. Returns the number of rows deleted.
pub fn bulk_delete(
    conn: &Connection,
    config: &StoreConfig,
    cancel: &CancelToken,
    rows: &[HostProfilePayload],
) -> Result<usize> {
    let policy = config.retry_policy();
    let mut deleted = 0;
    for chunk in rows.chunks(config.batch.delete_batch_size.max(1)) {
        deleted += with_retry_tx(conn, &policy, cancel, |tx| {
            delete_rows(tx, chunk, chunk.len(), cancel)
        })?;
    }
    Ok(deleted)
}

/// Upsert `rows` on the given connection or transaction in batches of
/// `batch_size`. Every column of an existing row is overwritten.
pub(crate) fn upsert_rows(
    conn: &Connection,
    rows: &[HostProfilePayload],
    batch_size: usize,
    cancel: &CancelToken,
) -> Result<usize> {
    let mut batch = Batch::new("(?, ?, ?, ?, ?, ?, ?)", batch_size, |values_clause, values| {
        cancel.check()?;
        conn.execute(
            &format!(
                "INSERT INTO host_mdm_profiles
                     (profile_uuid, host_uuid, status, operation_type, detail, command_uuid, profile_name)
                 VALUES {values_clause}
                 ON CONFLICT(profile_uuid, host_uuid) DO UPDATE SET
                     status = excluded.status,
                     operation_type = excluded.operation_type,
                     detail = excluded.detail,
                     command_uuid = excluded.command_uuid,
                     profile_name = excluded.profile_name"
            ),
            params_from_iter(values),
        )
        .context("upserting host profiles")?;
        Ok(())
    });
    for row in rows {
        batch.push([
            text(&row.profile_uuid),
            text(&row.host_uuid),
            opt_text(row.status.as_column()),
            opt_text(row.operation_type.map(OperationType::as_str)),
            text(&row.detail),
            text(&row.command_uuid),
            text(&row.profile_name),
        ])?;
    }
    batch.finish()
}

/// Delete `rows` by key on the given connection or transaction.
pub(crate) fn delete_rows(
    conn: &Connection,
    rows: &[HostProfilePayload],
    batch_size: usize,
    cancel: &CancelToken,
) -> Result<usize> {
    let mut deleted = 0;
    let mut batch = Batch::new("(?, ?)", batch_size, |values_clause, values| {
        cancel.check()?;
        deleted += conn
            .execute(
                &format!(
                    "DELETE FROM host_mdm_profiles
                     WHERE (profile_uuid, host_uuid) IN (VALUES {values_clause})"
                ),
                params_from_iter(values),
            )
            .context("deleting host profiles")?;
        Ok(())
    });
    for row in rows {
        batch.push([text(&row.profile_uuid), text(&row.host_uuid)])?;
    }
    batch.finish()?;
    Ok(deleted)
}

/// Host rows for `host_uuid` that were delivered by one of `command_uuids`.
pub(crate) fn rows_for_commands(
    conn: &Connection,
    host_uuid: &str,
    command_uuids: &[&str],
) -> Result<Vec<HostProfilePayload>> {
    if command_uuids.is_empty() {
        return Ok(Vec::new());
    }
    let mut params = vec![text(host_uuid)];
    params.extend(command_uuids.iter().map(|c| text(*c)));
    let sql = format!(
        "SELECT {PAYLOAD_COLUMNS} FROM host_mdm_profiles
         WHERE host_uuid = ? AND command_uuid IN ({})",
        placeholders(command_uuids.len())
    );
    query_payloads(conn, &sql, &params)
}

/// Profiles as shown for one host. Not-dispatched reads as pending, and
/// removals the device has already acknowledged are hidden.
pub fn host_view(conn: &Connection, host_uuid: &str) -> Result<Vec<HostProfileView>> {
    let sql = format!(
        "SELECT {PAYLOAD_COLUMNS} FROM host_mdm_profiles
         WHERE host_uuid = ?1
           AND NOT (operation_type IS 'remove'
                    AND COALESCE(status, '') IN ('verifying', 'verified'))
         ORDER BY profile_name, profile_uuid"
    );
    let rows = query_payloads(conn, &sql, &[text(host_uuid)])?;
    Ok(rows
        .into_iter()
        .map(|p| HostProfileView {
            profile_uuid: p.profile_uuid,
            name: p.profile_name,
            status: p.status.delivery(),
            operation_type: p.operation_type,
            detail: p.detail,
        })
        .collect())
}
