//! Response correlator: records a device's answers against the commands
//! that were queued for it.

use std::collections::{HashMap, HashSet};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use winmdm_types::profile::{HostProfilePayload, ProfileStatus};
use winmdm_types::protocol::{DeviceResponse, ProtocolOp, Verb};

use crate::batch::{opt_text, placeholders, text, Batch};
use crate::queries::{enrollments, profiles};
use crate::tx::with_retry_tx;
use crate::{now_secs, CancelToken, DbError, Result, ResultExt, StoreConfig};

/// What [`save_response`] did with a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Stored response row. `None` when nothing in the response was
    /// trackable and nothing was written.
    pub response_id: Option<i64>,
    /// Referenced commands that exist, in protocol order.
    pub matched: Vec<String>,
    /// Referenced identifiers with no command behind them.
    pub unmatched: Vec<String>,
    /// Host profile rows whose status was updated.
    pub profiles_updated: usize,
}

/// Profile delivery outcome derived from a device status for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileOutcome {
    pub host_uuid: String,
    pub command_uuid: String,
    pub status: ProfileStatus,
    pub detail: String,
}

impl ProfileOutcome {
    /// Any 2xx code means the device applied the change, which still has to
    /// be verified. Anything else is a failure.
    pub fn from_status_code(
        host_uuid: impl Into<String>,
        command_uuid: impl Into<String>,
        code: &str,
    ) -> Self {
        let accepted = code.len() == 3 && code.starts_with('2') && code.bytes().all(|b| b.is_ascii_digit());
        let (status, detail) = if accepted {
            (ProfileStatus::Verifying, String::new())
        } else {
            (ProfileStatus::Failed, format!("device reported status code {code:?}"))
        };
        Self {
            host_uuid: host_uuid.into(),
            command_uuid: command_uuid.into(),
            status,
            detail,
        }
    }
}

/// Trackable operations of a response, keyed by command reference. A later
/// operation with the same verb and reference replaces an earlier one.
#[derive(Default)]
struct Tracked<'a> {
    refs: Vec<&'a str>,
    statuses: HashMap<&'a str, &'a ProtocolOp>,
    results: HashMap<&'a str, &'a ProtocolOp>,
}

impl<'a> Tracked<'a> {
    fn collect(response: &'a DeviceResponse) -> Self {
        let mut tracked = Self::default();
        let mut seen = HashSet::new();
        for (cmd_ref, op) in response.tracked_ops() {
            match op.verb {
                Verb::Status => tracked.statuses.insert(cmd_ref, op),
                Verb::Results => tracked.results.insert(cmd_ref, op),
                Verb::Other(_) => continue,
            };
            if seen.insert(cmd_ref) {
                tracked.refs.push(cmd_ref);
            }
        }
        tracked
    }

    fn status_code(&self, cmd_ref: &str) -> Option<&'a str> {
        self.statuses
            .get(cmd_ref)
            .copied()
            .and_then(|op| op.data.as_deref())
            .filter(|code| !code.is_empty())
    }

    /// The Results operation as it was encoded in the response.
    fn raw_result(&self, cmd_ref: &str) -> Option<&'a [u8]> {
        self.results
            .get(cmd_ref)
            .copied()
            .filter(|op| op.data.is_some() && !op.encoded.is_empty())
            .map(|op| op.encoded.as_slice())
    }

    fn is_atomic(&self, cmd_ref: &str) -> bool {
        self.statuses.get(cmd_ref).is_some_and(|op| op.is_atomic())
    }
}

/// Record a device response.
///
/// Stores the raw response, merges a result row for every referenced
/// command that exists, updates host profile rows delivered by atomic
/// commands, and dequeues every matched command for this device whatever
/// its outcome. Unknown references are logged and skipped. All writes
/// happen in one unit of work, and the device's enrollment is looked up
/// inside it.
pub fn save_response(
    conn: &Connection,
    config: &StoreConfig,
    cancel: &CancelToken,
    device_id: &str,
    response: &DeviceResponse,
) -> Result<SaveReport> {
    if response.raw.is_empty() {
        return Err(DbError::InvalidInput(format!(
            "empty response from device {device_id}"
        )));
    }

    let tracked = Tracked::collect(response);
    if tracked.refs.is_empty() {
        return Ok(SaveReport::default());
    }

    with_retry_tx(conn, &config.retry_policy(), cancel, |tx| {
        let enrollment = enrollments::get_by_device_id(tx, device_id)?;

        tx.execute(
            "INSERT INTO mdm_responses (enrollment_id, raw_response, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![enrollment.id, response.raw, now_secs()],
        )
        .context("saving full response")?;
        let response_id = tx.last_insert_rowid();

        let existing = existing_commands(tx, &tracked.refs)?;
        let (matched, unmatched): (Vec<&str>, Vec<&str>) = tracked
            .refs
            .iter()
            .copied()
            .partition(|r| existing.contains(*r));
        if !unmatched.is_empty() {
            tracing::warn!(device_id, uuids = ?unmatched, "unmatched commands");
        }

        let mut report = SaveReport {
            response_id: Some(response_id),
            matched: matched.iter().map(|s| s.to_string()).collect(),
            unmatched: unmatched.iter().map(|s| s.to_string()).collect(),
            profiles_updated: 0,
        };
        if matched.is_empty() {
            return Ok(report);
        }

        let mut outcomes = Vec::new();
        let mut batch = Batch::new(
            "(?, ?, ?, ?, ?, ?, ?)",
            config.batch.upsert_batch_size,
            |values_clause, values| upsert_results(tx, values_clause, values),
        );
        let now = Value::Integer(now_secs());
        for &command_uuid in &matched {
            let status_code = tracked.status_code(command_uuid);
            if let (Some(code), Some(host_uuid)) = (status_code, enrollment.host_uuid.as_deref()) {
                if tracked.is_atomic(command_uuid) {
                    outcomes.push(ProfileOutcome::from_status_code(host_uuid, command_uuid, code));
                }
            }

            batch.push([
                Value::Integer(enrollment.id),
                text(command_uuid),
                tracked
                    .raw_result(command_uuid)
                    .map_or(Value::Null, |raw| Value::Blob(raw.to_vec())),
                opt_text(status_code),
                Value::Integer(response_id),
                now.clone(),
                now.clone(),
            ])?;
        }
        batch.finish()?;

        report.profiles_updated =
            apply_profile_outcomes(tx, &outcomes, config.batch.upsert_batch_size, cancel)?;

        dequeue(tx, enrollment.id, &matched)?;
        Ok(report)
    })
}

fn existing_commands(conn: &Connection, uuids: &[&str]) -> Result<HashSet<String>> {
    let sql = format!(
        "SELECT command_uuid FROM mdm_commands WHERE command_uuid IN ({})",
        placeholders(uuids.len())
    );
    let mut stmt = conn.prepare(&sql).context("prepare matching commands")?;
    let found = stmt
        .query_map(params_from_iter(uuids), |row| row.get(0))
        .context("selecting matching commands")?
        .collect::<std::result::Result<HashSet<String>, _>>()
        .context("read matching commands")?;
    Ok(found)
}

/// Results are merged: a NULL (absent) value keeps what is already stored.
fn upsert_results(conn: &Connection, values_clause: &str, values: &[Value]) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO mdm_command_results
                 (enrollment_id, command_uuid, raw_result, status_code, response_id,
                  created_at, updated_at)
             VALUES {values_clause}
             ON CONFLICT(enrollment_id, command_uuid) DO UPDATE SET
                 raw_result = COALESCE(excluded.raw_result, raw_result),
                 status_code = COALESCE(excluded.status_code, status_code),
                 response_id = excluded.response_id,
                 updated_at = excluded.updated_at"
        ),
        params_from_iter(values),
    )
    .context("inserting command results")?;
    Ok(())
}

/// Write outcomes onto the host profile rows that were delivered by the
/// outcome's command. Only status and detail change; rows are never
/// created here, so a device cannot add desired state. A verified row is
/// left alone, and a failed row only takes another failure.
///
/// Every outcome must be for the same host.
pub fn apply_profile_outcomes(
    conn: &Connection,
    outcomes: &[ProfileOutcome],
    batch_size: usize,
    cancel: &CancelToken,
) -> Result<usize> {
    let Some(first) = outcomes.first() else {
        return Ok(0);
    };
    let host_uuid = first.host_uuid.as_str();
    if let Some(other) = outcomes.iter().find(|o| o.host_uuid != host_uuid) {
        return Err(DbError::InvalidInput(format!(
            "profile outcomes for more than one host: {host_uuid} and {}",
            other.host_uuid
        )));
    }

    let by_command: HashMap<&str, &ProfileOutcome> = outcomes
        .iter()
        .map(|o| (o.command_uuid.as_str(), o))
        .collect();
    let command_uuids: Vec<&str> = by_command.keys().copied().collect();

    let updates: Vec<HostProfilePayload> =
        profiles::rows_for_commands(conn, host_uuid, &command_uuids)?
            .into_iter()
            .filter_map(|row| {
                let outcome = by_command.get(row.command_uuid.as_str())?;
                if !moves_forward(row.status, outcome.status) {
                    tracing::debug!(
                        host_uuid,
                        command_uuid = %row.command_uuid,
                        current = ?row.status,
                        reported = ?outcome.status,
                        "ignoring stale profile outcome"
                    );
                    return None;
                }
                Some(HostProfilePayload {
                    status: outcome.status,
                    detail: outcome.detail.clone(),
                    ..row
                })
            })
            .collect();

    profiles::upsert_rows(conn, &updates, batch_size, cancel)
}

/// A device outcome never moves a row back: verified is final, and a failed
/// row only takes another failure.
fn moves_forward(current: ProfileStatus, next: ProfileStatus) -> bool {
    match current {
        ProfileStatus::Verified => false,
        ProfileStatus::Failed => next == ProfileStatus::Failed,
        ProfileStatus::NotDispatched | ProfileStatus::Pending | ProfileStatus::Verifying => true,
    }
}

fn dequeue(conn: &Connection, enrollment_id: i64, command_uuids: &[&str]) -> Result<()> {
    let sql = format!(
        "DELETE FROM mdm_command_queue WHERE enrollment_id = ? AND command_uuid IN ({})",
        placeholders(command_uuids.len())
    );
    let mut params = vec![Value::Integer(enrollment_id)];
    params.extend(command_uuids.iter().map(|c| text(*c)));
    conn.execute(&sql, params_from_iter(&params))
        .context("dequeuing commands")?;
    Ok(())
}
