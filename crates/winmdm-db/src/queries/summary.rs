//! OS settings summary: profile delivery merged with disk encryption.

use std::time::Duration;

use rusqlite::types::ToSql;
use rusqlite::Connection;
use winmdm_types::disk_encryption::DiskEncryptionStatus;
use winmdm_types::profile::DeliveryStatus;
use winmdm_types::summary::ProfilesSummary;
use winmdm_types::{team_scope, TeamId, PLATFORM_WINDOWS};

use crate::queries::disk_encryption;
use crate::{parse_column, CancelToken, Result, ResultExt};

// Per-host profile delivery, checked in this order.
const PROFILES_FAILED: &str = "EXISTS (
    SELECT 1 FROM host_mdm_profiles hp
    WHERE hp.host_uuid = h.uuid AND hp.status = 'failed')";

const PROFILES_PENDING: &str = "EXISTS (
    SELECT 1 FROM host_mdm_profiles hp
    WHERE hp.host_uuid = h.uuid AND (hp.status IS NULL OR hp.status = 'pending'))";

const PROFILES_VERIFYING: &str = "EXISTS (
    SELECT 1 FROM host_mdm_profiles hp
    WHERE hp.host_uuid = h.uuid AND hp.operation_type = 'install' AND hp.status = 'verifying')
  AND NOT EXISTS (
    SELECT 1 FROM host_mdm_profiles hp
    WHERE hp.host_uuid = h.uuid AND hp.operation_type = 'install'
      AND (hp.status IS NULL OR hp.status NOT IN ('verifying', 'verified')))";

const PROFILES_VERIFIED: &str = "EXISTS (
    SELECT 1 FROM host_mdm_profiles hp
    WHERE hp.host_uuid = h.uuid AND hp.operation_type = 'install' AND hp.status = 'verified')
  AND NOT EXISTS (
    SELECT 1 FROM host_mdm_profiles hp
    WHERE hp.host_uuid = h.uuid AND hp.operation_type = 'install'
      AND (hp.status IS NULL OR hp.status != 'verified'))";

fn delivery_expr() -> String {
    format!(
        "CASE
             WHEN {PROFILES_FAILED} THEN 'failed'
             WHEN {PROFILES_PENDING} THEN 'pending'
             WHEN {PROFILES_VERIFYING} THEN 'verifying'
             WHEN {PROFILES_VERIFIED} THEN 'verified'
         END"
    )
}

/// How a disk-encryption class counts in the delivery buckets.
fn disk_bucket(status: DiskEncryptionStatus) -> DeliveryStatus {
    match status {
        DiskEncryptionStatus::Verified => DeliveryStatus::Verified,
        DiskEncryptionStatus::Verifying => DeliveryStatus::Verifying,
        DiskEncryptionStatus::Enforcing => DeliveryStatus::Pending,
        DiskEncryptionStatus::Failed => DeliveryStatus::Failed,
    }
}

/// Combine a host's profile delivery status with its disk-encryption class.
///
/// The result is never better than either input. `None` when neither input
/// says anything about the host.
pub fn merge_status(
    delivery: Option<DeliveryStatus>,
    disk: Option<DiskEncryptionStatus>,
) -> Option<DeliveryStatus> {
    let disk = disk.map(disk_bucket);
    match (delivery, disk) {
        (None, disk) => disk,
        (Some(DeliveryStatus::Failed), _) => Some(DeliveryStatus::Failed),
        (Some(DeliveryStatus::Pending), Some(DeliveryStatus::Failed)) => Some(DeliveryStatus::Failed),
        (Some(DeliveryStatus::Pending), _) => Some(DeliveryStatus::Pending),
        (Some(DeliveryStatus::Verifying), Some(d @ (DeliveryStatus::Failed | DeliveryStatus::Pending))) => {
            Some(d)
        }
        (Some(DeliveryStatus::Verifying), _) => Some(DeliveryStatus::Verifying),
        (Some(DeliveryStatus::Verified), disk) => Some(disk.unwrap_or(DeliveryStatus::Verified)),
    }
}

/// Count enrolled, non-server Windows hosts in a team scope by OS settings
/// status. Disk encryption is merged in when it is enforced for the scope.
///
/// Hosts with neither profile rows nor a disk-encryption class are not
/// counted.
pub fn profiles_summary(
    conn: &Connection,
    cancel: &CancelToken,
    team_id: TeamId,
    grace: Duration,
) -> Result<ProfilesSummary> {
    cancel.check()?;
    let include_disk = disk_encryption::is_enabled(conn, team_id)?;

    let disk_expr = if include_disk {
        disk_encryption::classify_expr()
    } else {
        "NULL".to_string()
    };
    let sql = format!(
        "SELECT h.id, {delivery}, {disk_expr}
         FROM hosts h
         JOIN host_mdm hm ON hm.host_id = h.id
         LEFT JOIN host_disk_encryption_keys hdek ON hdek.host_id = h.id
         LEFT JOIN host_disks hd ON hd.host_id = h.id
         WHERE h.platform = :platform
           AND hm.is_server = 0
           AND hm.enrolled = 1
           AND COALESCE(h.team_id, 0) = :team_id",
        delivery = delivery_expr(),
    );

    let team = team_scope(team_id);
    let grace_secs = grace.as_secs() as i64;
    let mut params: Vec<(&str, &dyn ToSql)> =
        vec![(":platform", &PLATFORM_WINDOWS), (":team_id", &team)];
    if include_disk {
        params.push((":grace_secs", &grace_secs));
    }

    let mut stmt = conn.prepare(&sql).context("prepare profiles summary")?;
    let rows = stmt
        .query_map(params.as_slice(), |row| {
            let delivery = row
                .get::<_, Option<String>>(1)?
                .map(|s| parse_column(1, s.parse::<DeliveryStatus>()))
                .transpose()?;
            let disk = row
                .get::<_, Option<String>>(2)?
                .map(|s| parse_column(2, s.parse::<DiskEncryptionStatus>()))
                .transpose()?;
            Ok((row.get::<_, i64>(0)?, delivery, disk))
        })
        .context("query profiles summary")?;

    let mut summary = ProfilesSummary::default();
    let mut unresolved = 0u64;
    for row in rows {
        let (host_id, delivery, disk) = row.context("read profiles summary")?;
        match merge_status(delivery, disk) {
            Some(status) => summary.record(status),
            None => {
                tracing::trace!(host_id, "host has no profile or disk encryption status");
                unresolved += 1;
            }
        }
    }
    if unresolved > 0 {
        tracing::debug!(
            team = team,
            hosts = unresolved,
            "windows hosts with mdm on but no profiles or disk encryption status"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{hosts, profiles};
    use winmdm_types::profile::{HostProfilePayload, OperationType, ProfileStatus};

    const GRACE: Duration = Duration::from_secs(3600);

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn add_host(conn: &Connection, uuid: &str) -> i64 {
        let id = hosts::insert(conn, uuid, None, PLATFORM_WINDOWS).expect("host");
        hosts::set_mdm(conn, id, true, false).expect("mdm");
        id
    }

    fn set_profiles(conn: &Connection, host: &str, statuses: &[ProfileStatus]) {
        let rows: Vec<HostProfilePayload> = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut row = HostProfilePayload::new(format!("p{i}"), host);
                row.operation_type = Some(OperationType::Install);
                row.status = *status;
                row
            })
            .collect();
        profiles::upsert_rows(conn, &rows, 100, &CancelToken::new()).expect("profiles");
    }

    fn summarize(conn: &Connection) -> ProfilesSummary {
        profiles_summary(conn, &CancelToken::new(), None, GRACE).expect("summary")
    }

    #[test]
    fn test_merge_table() {
        use DeliveryStatus as D;
        use DiskEncryptionStatus as E;

        assert_eq!(merge_status(Some(D::Failed), Some(E::Verified)), Some(D::Failed));
        assert_eq!(merge_status(Some(D::Pending), Some(E::Failed)), Some(D::Failed));
        assert_eq!(merge_status(Some(D::Pending), Some(E::Verified)), Some(D::Pending));
        assert_eq!(merge_status(Some(D::Verifying), Some(E::Enforcing)), Some(D::Pending));
        assert_eq!(merge_status(Some(D::Verifying), Some(E::Verified)), Some(D::Verifying));
        assert_eq!(merge_status(Some(D::Verified), Some(E::Verifying)), Some(D::Verifying));
        assert_eq!(merge_status(Some(D::Verified), Some(E::Enforcing)), Some(D::Pending));
        assert_eq!(merge_status(Some(D::Verified), None), Some(D::Verified));
        assert_eq!(merge_status(None, Some(E::Enforcing)), Some(D::Pending));
        assert_eq!(merge_status(None, None), None);
    }

    #[test]
    fn test_profiles_only() {
        let conn = test_db();
        add_host(&conn, "failed");
        set_profiles(&conn, "failed", &[ProfileStatus::Verified, ProfileStatus::Failed]);
        add_host(&conn, "pending");
        set_profiles(&conn, "pending", &[ProfileStatus::NotDispatched, ProfileStatus::Verified]);
        add_host(&conn, "verifying");
        set_profiles(&conn, "verifying", &[ProfileStatus::Verifying, ProfileStatus::Verified]);
        add_host(&conn, "verified");
        set_profiles(&conn, "verified", &[ProfileStatus::Verified]);
        add_host(&conn, "nothing");

        assert_eq!(
            summarize(&conn),
            ProfilesSummary {
                failed: 1,
                pending: 1,
                verifying: 1,
                verified: 1,
            }
        );
    }

    #[test]
    fn test_disk_encryption_merged_when_enabled() {
        let conn = test_db();
        let verified = add_host(&conn, "verified");
        set_profiles(&conn, "verified", &[ProfileStatus::Verified]);
        add_host(&conn, "no-profiles");

        disk_encryption::set_enabled(&conn, None, false).expect("disable");
        assert_eq!(summarize(&conn).verified, 1);
        assert_eq!(summarize(&conn).total(), 1);

        // No key escrowed yet: both hosts are enforcing, which counts as pending.
        disk_encryption::set_enabled(&conn, None, true).expect("enable");
        let summary = summarize(&conn);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.verified, 0);

        hosts::set_encryption_key(&conn, verified, "a2V5", true, "", 100).expect("key");
        hosts::set_disk_encrypted(&conn, verified, true, 200).expect("disk");
        let summary = summarize(&conn);
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.pending, 1);
    }

    #[test]
    fn test_server_and_other_team_excluded() {
        let conn = test_db();
        let server = hosts::insert(&conn, "server", None, PLATFORM_WINDOWS).expect("host");
        hosts::set_mdm(&conn, server, true, true).expect("mdm");
        set_profiles(&conn, "server", &[ProfileStatus::Failed]);

        let other = hosts::insert(&conn, "other", Some(3), PLATFORM_WINDOWS).expect("host");
        hosts::set_mdm(&conn, other, true, false).expect("mdm");
        set_profiles(&conn, "other", &[ProfileStatus::Failed]);

        assert_eq!(summarize(&conn), ProfilesSummary::default());
        let team3 = profiles_summary(&conn, &CancelToken::new(), Some(3), GRACE).expect("summary");
        assert_eq!(team3.failed, 1);
    }
}
