//! Enrollment registry.

use rusqlite::{Connection, OptionalExtension, Row};
use winmdm_types::enrollment::EnrolledDevice;

use crate::{now_secs, DbError, Result, ResultExt};

const COLUMNS: &str = "id, device_id, hardware_id, device_state, device_type, device_name, \
     enroll_type, enroll_user_id, enroll_proto_version, enroll_client_version, \
     not_in_oobe, host_uuid, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<EnrolledDevice> {
    Ok(EnrolledDevice {
        id: row.get(0)?,
        device_id: row.get(1)?,
        hardware_id: row.get(2)?,
        device_state: row.get(3)?,
        device_type: row.get(4)?,
        device_name: row.get(5)?,
        enroll_type: row.get(6)?,
        enroll_user_id: row.get(7)?,
        enroll_proto_version: row.get(8)?,
        enroll_client_version: row.get(9)?,
        not_in_oobe: row.get(10)?,
        host_uuid: row.get(11)?,
        created_at: row.get::<_, i64>(12)? as u64,
        updated_at: row.get::<_, i64>(13)? as u64,
    })
}

/// Look up an enrollment by the identifier the device presents.
pub fn get_by_device_id(conn: &Connection, device_id: &str) -> Result<EnrolledDevice> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM mdm_enrollments WHERE device_id = ?1"),
        [device_id],
        from_row,
    )
    .optional()
    .context("get enrollment")?
    .ok_or_else(|| DbError::NotFound(format!("enrollment for device {device_id}")))
}

/// Insert an enrollment, or overwrite the mutable fields of the one with
/// the same hardware id. Returns the row id.
///
/// A device id already used by a different hardware id is `AlreadyExists`.
/// An existing host link is kept when the new record has none.
pub fn upsert(conn: &Connection, device: &EnrolledDevice) -> Result<i64> {
    let now = now_secs();
    conn.query_row(
        "INSERT INTO mdm_enrollments (
             device_id, hardware_id, device_state, device_type, device_name,
             enroll_type, enroll_user_id, enroll_proto_version, enroll_client_version,
             not_in_oobe, host_uuid, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
         ON CONFLICT(hardware_id) DO UPDATE SET
             device_id = excluded.device_id,
             device_state = excluded.device_state,
             device_type = excluded.device_type,
             device_name = excluded.device_name,
             enroll_type = excluded.enroll_type,
             enroll_user_id = excluded.enroll_user_id,
             enroll_proto_version = excluded.enroll_proto_version,
             enroll_client_version = excluded.enroll_client_version,
             not_in_oobe = excluded.not_in_oobe,
             host_uuid = COALESCE(excluded.host_uuid, host_uuid),
             updated_at = excluded.updated_at
         RETURNING id",
        rusqlite::params![
            device.device_id,
            device.hardware_id,
            device.device_state,
            device.device_type,
            device.device_name,
            device.enroll_type,
            device.enroll_user_id,
            device.enroll_proto_version,
            device.enroll_client_version,
            device.not_in_oobe,
            device.host_uuid,
            now,
        ],
        |row| row.get(0),
    )
    .or_exists(
        || format!("enrollment for device {}", device.device_id),
        "upserting enrollment",
    )
}

/// Delete the enrollment with this hardware id.
pub fn delete_by_hardware_id(conn: &Connection, hardware_id: &str) -> Result<()> {
    delete_where(conn, "hardware_id", hardware_id)
}

/// Delete the enrollment with this device id.
pub fn delete_by_device_id(conn: &Connection, device_id: &str) -> Result<()> {
    delete_where(conn, "device_id", device_id)
}

fn delete_where(conn: &Connection, column: &'static str, value: &str) -> Result<()> {
    let deleted = conn
        .execute(
            &format!("DELETE FROM mdm_enrollments WHERE {column} = ?1"),
            [value],
        )
        .context("deleting enrollment")?;
    if deleted != 1 {
        return Err(DbError::NotFound(format!("enrollment with {column} {value}")));
    }
    Ok(())
}

/// Record which host a device belongs to once its identity is resolved.
pub fn link_host(conn: &Connection, device_id: &str, host_uuid: &str) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE mdm_enrollments
             SET host_uuid = ?1,
                 updated_at = CASE WHEN host_uuid IS ?1 THEN updated_at ELSE ?2 END
             WHERE device_id = ?3",
            rusqlite::params![host_uuid, now_secs(), device_id],
        )
        .context("linking enrollment to host")?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("enrollment for device {device_id}")));
    }
    Ok(())
}
