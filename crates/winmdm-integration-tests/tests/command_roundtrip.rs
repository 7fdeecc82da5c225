//! Integration test: command dispatch and response correlation.
//!
//! Commands are queued for several devices, answered over one or more
//! management sessions, and the stored results, queue and host profile
//! rows are checked after each response.

use rusqlite::Connection;
use winmdm_db::queries::{commands, enrollments, hosts, profiles, responses, summary};
use winmdm_db::{CancelToken, DbError, StoreConfig};
use winmdm_types::command::MdmCommand;
use winmdm_types::enrollment::EnrolledDevice;
use winmdm_types::profile::{DeliveryStatus, HostProfilePayload, OperationType, ProfileStatus};
use winmdm_types::protocol::{CommandClass, DeviceResponse, ProtocolOp};
use winmdm_types::PLATFORM_WINDOWS;

const LOC_URI: &str = "./Device/Vendor/MSFT/BitLocker/RequireDeviceEncryption";

fn setup() -> (Connection, StoreConfig) {
    let conn = winmdm_db::open_memory().expect("open test db");
    for (n, host) in [(1, "host-1"), (2, "host-2")] {
        let id = hosts::insert(&conn, host, None, PLATFORM_WINDOWS).expect("host");
        hosts::set_mdm(&conn, id, true, false).expect("mdm");
        let mut device = EnrolledDevice::new(format!("dev-{n}"), format!("hw-{n}"));
        device.host_uuid = Some(host.to_string());
        enrollments::upsert(&conn, &device).expect("enroll");
    }
    (conn, StoreConfig::default())
}

fn dispatch(conn: &Connection, config: &StoreConfig, uuid: &str, targets: &[&str]) {
    let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
    commands::create_and_enqueue(
        conn,
        config,
        &CancelToken::new(),
        &MdmCommand::new(uuid, format!("<Exec><CmdID>{uuid}</CmdID></Exec>").into_bytes(), LOC_URI),
        &targets,
    )
    .expect("dispatch");
}

fn respond(
    conn: &Connection,
    config: &StoreConfig,
    device_id: &str,
    ops: Vec<ProtocolOp>,
) -> responses::SaveReport {
    let response = DeviceResponse::new(format!("<SyncML>{device_id}</SyncML>").into_bytes(), ops);
    responses::save_response(conn, config, &CancelToken::new(), device_id, &response)
        .expect("save response")
}

fn stored_result(conn: &Connection, device_id: &str, uuid: &str) -> (Option<Vec<u8>>, Option<String>) {
    conn.query_row(
        "SELECT r.raw_result, r.status_code
         FROM mdm_command_results r JOIN mdm_enrollments e ON e.id = r.enrollment_id
         WHERE e.device_id = ?1 AND r.command_uuid = ?2",
        [device_id, uuid],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .expect("stored result")
}

#[test]
fn response_dequeues_only_the_answering_device() {
    let (conn, config) = setup();
    dispatch(&conn, &config, "cmd-1", &["dev-1", "dev-2"]);
    dispatch(&conn, &config, "cmd-2", &["dev-1"]);

    let report = respond(&conn, &config, "dev-1", vec![ProtocolOp::status("cmd-1", "500")]);
    assert_eq!(report.matched, vec!["cmd-1".to_string()]);
    assert!(report.unmatched.is_empty());

    let pending: Vec<String> = commands::get_pending(&conn, "dev-1")
        .expect("pending")
        .into_iter()
        .map(|c| c.command_uuid)
        .collect();
    assert_eq!(pending, vec!["cmd-2".to_string()]);
    assert_eq!(commands::get_pending(&conn, "dev-2").expect("pending").len(), 1);

    let results = commands::results_for_command(&conn, "cmd-1").expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].host_uuid.as_deref(), Some("host-1"));
    assert_eq!(results[0].status.as_deref(), Some("500"));
    assert_eq!(results[0].request_type, LOC_URI);
    assert_eq!(results[0].result, b"<SyncML>dev-1</SyncML>".to_vec());
}

#[test]
fn later_response_merges_into_existing_result() {
    let (conn, config) = setup();
    dispatch(&conn, &config, "cmd-1", &["dev-1"]);

    respond(
        &conn,
        &config,
        "dev-1",
        vec![
            ProtocolOp::status("cmd-1", "200"),
            ProtocolOp::results("cmd-1", "<Item><Data>1</Data></Item>"),
        ],
    );
    let (raw, status) = stored_result(&conn, "dev-1", "cmd-1");
    assert_eq!(raw.as_deref(), Some(b"<Item><Data>1</Data></Item>".as_slice()));
    assert_eq!(status.as_deref(), Some("200"));

    // A status-only answer keeps the earlier result payload.
    respond(&conn, &config, "dev-1", vec![ProtocolOp::status("cmd-1", "202")]);
    let (raw, status) = stored_result(&conn, "dev-1", "cmd-1");
    assert_eq!(raw.as_deref(), Some(b"<Item><Data>1</Data></Item>".as_slice()));
    assert_eq!(status.as_deref(), Some("202"));

    let responses: i64 = conn
        .query_row("SELECT COUNT(*) FROM mdm_responses", [], |row| row.get(0))
        .expect("count");
    assert_eq!(responses, 2);
}

#[test]
fn unmatched_references_are_kept_out_of_results() {
    let (conn, config) = setup();
    dispatch(&conn, &config, "cmd-1", &["dev-1"]);

    let report = respond(
        &conn,
        &config,
        "dev-1",
        vec![
            ProtocolOp::status("ghost", "200"),
            ProtocolOp::status("cmd-1", "200"),
            ProtocolOp::status("0", "200").with_class(CommandClass::Header),
        ],
    );
    assert!(report.response_id.is_some());
    assert_eq!(report.matched, vec!["cmd-1".to_string()]);
    assert_eq!(report.unmatched, vec!["ghost".to_string()]);

    let results: i64 = conn
        .query_row("SELECT COUNT(*) FROM mdm_command_results", [], |row| row.get(0))
        .expect("count");
    assert_eq!(results, 1);
}

#[test]
fn decoded_response_from_json() {
    let (conn, config) = setup();
    dispatch(&conn, &config, "cmd-1", &["dev-2"]);

    let response: DeviceResponse = serde_json::from_value(serde_json::json!({
        "raw": "3c53796e634d4c2f3e",
        "ops": [
            {"verb": "status", "cmd_ref": "cmd-1", "data": "200", "cmd_class": null},
            {"verb": {"other": "alert"}, "cmd_ref": null, "data": "1201", "cmd_class": null}
        ]
    }))
    .expect("decode response");
    assert_eq!(response.raw, b"<SyncML/>".to_vec());

    let report =
        responses::save_response(&conn, &config, &CancelToken::new(), "dev-2", &response)
            .expect("save");
    assert_eq!(report.matched, vec!["cmd-1".to_string()]);
    assert!(commands::get_pending(&conn, "dev-2").expect("pending").is_empty());
}

#[test]
fn unknown_device_is_not_found() {
    let (conn, config) = setup();
    let response = DeviceResponse::new(b"<SyncML/>".to_vec(), vec![ProtocolOp::status("c", "200")]);
    let result =
        responses::save_response(&conn, &config, &CancelToken::new(), "dev-9", &response);
    assert!(matches!(result, Err(DbError::NotFound(_))));
}

#[test]
fn failed_atomic_status_fails_the_profile() {
    let (conn, config) = setup();
    let cancel = CancelToken::new();
    let profile = profiles::create(&conn, None, "Firewall", b"<Atomic/>").expect("profile");
    profiles::apply_pending(&conn, &config, &cancel, Some(&["host-1".to_string()][..]))
        .expect("apply");

    dispatch(&conn, &config, "cmd-fw", &["host-1"]);
    let mut row = HostProfilePayload::new(&profile.profile_uuid, "host-1");
    row.profile_name = profile.name.clone();
    row.operation_type = Some(OperationType::Install);
    row.status = ProfileStatus::Pending;
    row.command_uuid = "cmd-fw".into();
    profiles::bulk_upsert_status(&conn, &config, &cancel, &[row]).expect("pending");

    let report = respond(
        &conn,
        &config,
        "dev-1",
        vec![ProtocolOp::status("cmd-fw", "405").with_class(CommandClass::Atomic)],
    );
    assert_eq!(report.profiles_updated, 1);

    let view = profiles::host_view(&conn, "host-1").expect("view");
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].status, DeliveryStatus::Failed);
    assert!(view[0].detail.contains("405"));

    // host-2 was never reconciled, so only host-1 is counted.
    let counts = summary::profiles_summary(
        &conn,
        &cancel,
        None,
        config.disk_encryption.grace_period(),
    )
    .expect("summary");
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.total(), 1);
}

#[test]
fn unenrolling_drops_queued_commands() {
    let (conn, config) = setup();
    dispatch(&conn, &config, "cmd-1", &["dev-1"]);
    enrollments::delete_by_device_id(&conn, "dev-1").expect("unenroll");
    assert!(commands::get_pending(&conn, "dev-1").expect("pending").is_empty());
    assert!(matches!(
        enrollments::get_by_device_id(&conn, "dev-1"),
        Err(DbError::NotFound(_))
    ));
}
