//! Disk-encryption (BitLocker) classification.
//!
//! A host's class is decided by four SQL predicates over the host's MDM row
//! (`hm`), escrowed key row (`hdek`) and disk row (`hd`). The same fragments
//! drive the single-host lookup and the fleet counts, and are mutually
//! exclusive for every non-server host. Each fragment is NULL-safe: missing
//! signal rows make a condition false, never unknown.
//!
//! Fragments bind `:grace_secs`.

use std::time::Duration;

use rusqlite::{named_params, Connection, OptionalExtension};
use winmdm_types::disk_encryption::{
    DiskEncryptionStatus, DiskEncryptionSummary, HostDiskEncryption,
};
use winmdm_types::host::Host;
use winmdm_types::{team_scope, TeamId, PLATFORM_WINDOWS};

use crate::{parse_column, CancelToken, Result, ResultExt};

const NOT_SERVER: &str = "(hm.is_server IS NOT NULL AND hm.is_server = 0)";

const KEY_AVAILABLE: &str = "(hdek.base64_encrypted IS NOT NULL AND hdek.base64_encrypted != '' \
     AND hdek.decryptable IS NOT NULL AND hdek.decryptable = 1)";

const ENCRYPTED: &str = "(hd.encrypted IS NOT NULL AND hd.encrypted = 1)";

/// The disk report is at least as fresh as the key.
const DISKS_UPDATED: &str = "(hd.updated_at IS NOT NULL AND hdek.updated_at IS NOT NULL \
     AND hd.updated_at >= hdek.updated_at)";

const CLIENT_ERROR: &str = "(hdek.client_error IS NOT NULL AND hdek.client_error != '')";

/// The disk report falls within the grace window after the key update.
const WITHIN_GRACE: &str = "(hd.updated_at IS NOT NULL AND hdek.updated_at IS NOT NULL \
     AND hd.updated_at - hdek.updated_at <= :grace_secs)";

/// SQL condition that holds exactly for hosts in `status`.
pub fn predicate(status: DiskEncryptionStatus) -> String {
    match status {
        DiskEncryptionStatus::Failed => format!("{NOT_SERVER} AND {CLIENT_ERROR}"),
        DiskEncryptionStatus::Verified => format!(
            "{NOT_SERVER} AND NOT {CLIENT_ERROR} AND {KEY_AVAILABLE} \
             AND {ENCRYPTED} AND {DISKS_UPDATED}"
        ),
        DiskEncryptionStatus::Verifying => format!(
            "{NOT_SERVER} AND NOT {CLIENT_ERROR} AND {KEY_AVAILABLE} AND (
                 ({ENCRYPTED} AND NOT {DISKS_UPDATED})
                 OR (NOT {ENCRYPTED} AND {DISKS_UPDATED} AND {WITHIN_GRACE})
             )"
        ),
        DiskEncryptionStatus::Enforcing => format!(
            "{NOT_SERVER} AND NOT {CLIENT_ERROR} AND (
                 NOT {KEY_AVAILABLE}
                 OR ({KEY_AVAILABLE} AND NOT {ENCRYPTED}
                     AND (NOT {DISKS_UPDATED} OR NOT {WITHIN_GRACE}))
             )"
        ),
    }
}

/// Classes in precedence order.
const PRECEDENCE: [DiskEncryptionStatus; 4] = [
    DiskEncryptionStatus::Failed,
    DiskEncryptionStatus::Verified,
    DiskEncryptionStatus::Verifying,
    DiskEncryptionStatus::Enforcing,
];

/// `CASE` expression yielding the class name, or NULL when no predicate
/// holds (server hosts, unknown server flag).
pub fn classify_expr() -> String {
    let mut expr = String::from("CASE");
    for status in PRECEDENCE {
        expr.push_str(&format!(
            " WHEN ({}) THEN '{}'",
            predicate(status),
            status.as_str()
        ));
    }
    expr.push_str(" END");
    expr
}

/// Whether disk encryption is enforced for a team scope. Unset = disabled.
pub fn is_enabled(conn: &Connection, team_id: TeamId) -> Result<bool> {
    let enabled = conn
        .query_row(
            "SELECT enabled FROM disk_encryption_settings WHERE team_id = ?1",
            [team_scope(team_id)],
            |row| row.get(0),
        )
        .optional()
        .context("get disk encryption setting")?;
    Ok(enabled.unwrap_or(false))
}

/// Turn disk-encryption enforcement on or off for a team scope.
pub fn set_enabled(conn: &Connection, team_id: TeamId, enabled: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO disk_encryption_settings (team_id, enabled) VALUES (?1, ?2)
         ON CONFLICT(team_id) DO UPDATE SET enabled = excluded.enabled",
        rusqlite::params![team_scope(team_id), enabled],
    )
    .context("setting disk encryption")?;
    Ok(())
}

/// Host counts per class for a team scope. All zero when enforcement is
/// disabled for the scope.
pub fn summary(
    conn: &Connection,
    cancel: &CancelToken,
    team_id: TeamId,
    grace: Duration,
) -> Result<DiskEncryptionSummary> {
    cancel.check()?;
    if !is_enabled(conn, team_id)? {
        return Ok(DiskEncryptionSummary::default());
    }

    let sql = format!(
        "SELECT
             COUNT(CASE WHEN ({verified}) THEN 1 END),
             COUNT(CASE WHEN ({verifying}) THEN 1 END),
             COUNT(CASE WHEN ({enforcing}) THEN 1 END),
             COUNT(CASE WHEN ({failed}) THEN 1 END)
         FROM hosts h
         LEFT JOIN host_mdm hm ON hm.host_id = h.id
         LEFT JOIN host_disk_encryption_keys hdek ON hdek.host_id = h.id
         LEFT JOIN host_disks hd ON hd.host_id = h.id
         WHERE h.platform = :platform
           AND hm.is_server = 0
           AND COALESCE(h.team_id, 0) = :team_id",
        verified = predicate(DiskEncryptionStatus::Verified),
        verifying = predicate(DiskEncryptionStatus::Verifying),
        enforcing = predicate(DiskEncryptionStatus::Enforcing),
        failed = predicate(DiskEncryptionStatus::Failed),
    );
    let counts = |row: &rusqlite::Row<'_>, i: usize| row.get::<_, i64>(i).map(|n| n as u64);
    conn.query_row(
        &sql,
        named_params! {
            ":platform": PLATFORM_WINDOWS,
            ":team_id": team_scope(team_id),
            ":grace_secs": grace.as_secs() as i64,
        },
        |row| {
            Ok(DiskEncryptionSummary {
                verified: counts(row, 0)?,
                verifying: counts(row, 1)?,
                action_required: 0,
                enforcing: counts(row, 2)?,
                failed: counts(row, 3)?,
                removing_enforcement: 0,
            })
        },
    )
    .context("disk encryption summary")
}

/// Classify one host.
///
/// `None` for non-Windows hosts, server hosts, and scopes where enforcement
/// is disabled. A host with no signal rows at all is `Enforcing`.
pub fn status(conn: &Connection, host: &Host, grace: Duration) -> Result<Option<HostDiskEncryption>> {
    if host.platform != PLATFORM_WINDOWS {
        tracing::debug!(host_id = host.id, platform = %host.platform, "no disk encryption status for non-windows host");
        return Ok(None);
    }
    if host.is_server {
        tracing::debug!(host_id = host.id, "no disk encryption status for server host");
        return Ok(None);
    }
    if !is_enabled(conn, host.team_id)? {
        return Ok(None);
    }

    let sql = format!(
        "SELECT {classify}, COALESCE(hdek.client_error, '')
         FROM host_mdm hm
         LEFT JOIN host_disk_encryption_keys hdek ON hdek.host_id = hm.host_id
         LEFT JOIN host_disks hd ON hd.host_id = hm.host_id
         WHERE hm.host_id = :host_id",
        classify = classify_expr(),
    );
    let found = conn
        .query_row(
            &sql,
            named_params! {
                ":host_id": host.id,
                ":grace_secs": grace.as_secs() as i64,
            },
            |row| {
                let status = row
                    .get::<_, Option<String>>(0)?
                    .map(|s| parse_column(0, s.parse::<DiskEncryptionStatus>()))
                    .transpose()?;
                Ok((status, row.get::<_, String>(1)?))
            },
        )
        .optional()
        .context("disk encryption status")?;

    match found {
        Some((Some(status), detail)) => Ok(Some(HostDiskEncryption { status, detail })),
        Some((None, detail)) => {
            tracing::debug!(host_id = host.id, "unclassifiable disk encryption signals");
            Ok(Some(HostDiskEncryption {
                status: DiskEncryptionStatus::Enforcing,
                detail,
            }))
        }
        None => {
            tracing::debug!(host_id = host.id, "no disk encryption status found for host");
            Ok(Some(HostDiskEncryption {
                status: DiskEncryptionStatus::Enforcing,
                detail: String::new(),
            }))
        }
    }
}
