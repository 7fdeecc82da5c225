//! Command dispatch queue.

use rusqlite::{Connection, Row};
use winmdm_types::command::{CommandResult, MdmCommand};

use crate::tx::with_retry_tx;
use crate::{now_secs, CancelToken, DbError, Result, ResultExt, StoreConfig};

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<MdmCommand> {
    Ok(MdmCommand {
        command_uuid: row.get(0)?,
        raw_command: row.get(1)?,
        target_loc_uri: row.get(2)?,
        created_at: row.get::<_, i64>(3)? as u64,
        updated_at: row.get::<_, i64>(4)? as u64,
    })
}

/// Create `command` and queue it for every target, all or nothing.
///
/// A target is a host UUID or a device id. Empty `targets` is a no-op and
/// does not create the command.
pub fn create_and_enqueue(
    conn: &Connection,
    config: &StoreConfig,
    cancel: &CancelToken,
    command: &MdmCommand,
    targets: &[String],
) -> Result<()> {
    if targets.is_empty() {
        return Ok(());
    }

    with_retry_tx(conn, &config.retry_policy(), cancel, |tx| {
        insert_command(tx, command)?;
        for target in targets {
            enqueue(tx, &command.command_uuid, target)?;
        }
        Ok(())
    })
}

fn insert_command(conn: &Connection, command: &MdmCommand) -> Result<()> {
    let now = now_secs();
    conn.execute(
        "INSERT INTO mdm_commands (command_uuid, raw_command, target_loc_uri, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        rusqlite::params![
            command.command_uuid,
            command.raw_command,
            command.target_loc_uri,
            now,
        ],
    )
    .or_exists(
        || format!("command {}", command.command_uuid),
        "inserting command",
    )?;
    Ok(())
}

fn enqueue(conn: &Connection, command_uuid: &str, target: &str) -> Result<()> {
    let queued = conn
        .execute(
            "INSERT INTO mdm_command_queue (enrollment_id, command_uuid, created_at)
             SELECT id, ?1, ?2 FROM mdm_enrollments
             WHERE host_uuid = ?3 OR device_id = ?3",
            rusqlite::params![command_uuid, now_secs(), target],
        )
        .or_exists(
            || format!("queue entry for command {command_uuid} on {target}"),
            "queueing command",
        )?;
    if queued == 0 {
        return Err(DbError::NotFound(format!("enrollment for {target}")));
    }
    Ok(())
}

/// Commands queued for a device that have no recorded result yet.
///
/// Order is unspecified.
pub fn get_pending(conn: &Connection, device_id: &str) -> Result<Vec<MdmCommand>> {
    let mut stmt = conn
        .prepare(
            "SELECT c.command_uuid, c.raw_command, c.target_loc_uri, c.created_at, c.updated_at
             FROM mdm_command_queue q
             JOIN mdm_enrollments e ON e.id = q.enrollment_id
             JOIN mdm_commands c ON c.command_uuid = q.command_uuid
             LEFT JOIN mdm_command_results r
                 ON r.enrollment_id = q.enrollment_id AND r.command_uuid = q.command_uuid
             WHERE e.device_id = ?1 AND r.command_uuid IS NULL",
        )
        .context("prepare pending commands")?;
    let commands = stmt
        .query_map([device_id], command_from_row)
        .context("query pending commands")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("read pending commands")?;
    Ok(commands)
}

/// Every host's recorded result for a command.
pub fn results_for_command(conn: &Connection, command_uuid: &str) -> Result<Vec<CommandResult>> {
    let mut stmt = conn
        .prepare(
            "SELECT e.host_uuid, r.command_uuid, r.status_code, c.target_loc_uri,
                    resp.raw_response, r.updated_at
             FROM mdm_command_results r
             JOIN mdm_enrollments e ON e.id = r.enrollment_id
             JOIN mdm_commands c ON c.command_uuid = r.command_uuid
             JOIN mdm_responses resp ON resp.id = r.response_id
             WHERE r.command_uuid = ?1
             ORDER BY e.host_uuid",
        )
        .context("prepare command results")?;
    let results = stmt
        .query_map([command_uuid], |row| {
            Ok(CommandResult {
                host_uuid: row.get(0)?,
                command_uuid: row.get(1)?,
                status: row.get(2)?,
                request_type: row.get(3)?,
                result: row.get(4)?,
                updated_at: row.get::<_, i64>(5)? as u64,
            })
        })
        .context("query command results")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("read command results")?;
    Ok(results)
}
