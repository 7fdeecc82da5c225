//! Integration test: configuration profile lifecycle.
//!
//! Exercises a profile from creation to removal on a file-backed store:
//! 1. Create a team profile and an enrolled host in that team
//! 2. Reconcile: the pair lands in the install set and is written
//! 3. Dispatch the profile as a command and mark the row pending
//! 4. The device acknowledges the atomic command (verifying)
//! 5. Verification marks the row verified
//! 6. The host moves team; reconciliation removes the row

use rusqlite::Connection;
use winmdm_db::queries::{commands, enrollments, hosts, profiles, responses, summary};
use winmdm_db::{CancelToken, StoreConfig};
use winmdm_types::command::MdmCommand;
use winmdm_types::enrollment::EnrolledDevice;
use winmdm_types::profile::{DeliveryStatus, HostProfilePayload, OperationType, ProfileStatus};
use winmdm_types::protocol::{CommandClass, DeviceResponse, ProtocolOp};
use winmdm_types::summary::ProfilesSummary;
use winmdm_types::PLATFORM_WINDOWS;

fn open_store(dir: &tempfile::TempDir) -> (Connection, StoreConfig) {
    let mut config = StoreConfig::default();
    config.database.path = dir.path().join("winmdm.db").to_string_lossy().into_owned();
    let conn = winmdm_db::open_with_config(&config).expect("open store");
    (conn, config)
}

fn enrolled_host(conn: &Connection, uuid: &str, team: Option<u32>) -> i64 {
    let id = hosts::insert(conn, uuid, team, PLATFORM_WINDOWS).expect("insert host");
    hosts::set_mdm(conn, id, true, false).expect("host mdm");
    let mut device = EnrolledDevice::new(format!("dev-{uuid}"), format!("hw-{uuid}"));
    device.host_uuid = Some(uuid.to_string());
    enrollments::upsert(conn, &device).expect("enroll");
    id
}

fn host_rows(conn: &Connection, host: &str) -> Vec<(String, Option<String>, Option<String>)> {
    let mut stmt = conn
        .prepare(
            "SELECT profile_name, operation_type, status FROM host_mdm_profiles
             WHERE host_uuid = ?1 ORDER BY profile_name",
        )
        .expect("prepare");
    stmt.query_map([host], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows")
}

#[test]
fn profile_install_verify_and_remove() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (conn, config) = open_store(&dir);
    let cancel = CancelToken::new();

    // =========================================================
    // Step 1: profile P1 in team 1, host H1 enrolled in team 1
    // =========================================================
    let p1 = profiles::create(&conn, Some(1), "P1", b"<Replace/>").expect("create profile");
    let h1 = enrolled_host(&conn, "H1", Some(1));

    // =========================================================
    // Step 2: reconcile
    // =========================================================
    let install = profiles::compute_install_set(&conn, None).expect("install set");
    assert_eq!(install.len(), 1);
    assert_eq!(install[0].profile_uuid, p1.profile_uuid);
    assert_eq!(install[0].host_uuid, "H1");
    assert!(profiles::compute_remove_set(&conn, None).expect("remove set").is_empty());

    let applied = profiles::apply_pending(&conn, &config, &cancel, None).expect("apply");
    assert_eq!(applied.upserted, 1);
    assert_eq!(
        host_rows(&conn, "H1"),
        vec![("P1".to_string(), Some("install".to_string()), None)]
    );

    // Not dispatched yet, so it stays in the install set.
    assert_eq!(profiles::compute_install_set(&conn, None).expect("install set").len(), 1);

    // =========================================================
    // Step 3: dispatch
    // =========================================================
    let command = MdmCommand::new("cmd-p1", p1.content.clone(), "./Device/Vendor/MSFT/Policy");
    commands::create_and_enqueue(&conn, &config, &cancel, &command, &["H1".to_string()])
        .expect("enqueue");
    let mut row = HostProfilePayload::new(&p1.profile_uuid, "H1");
    row.profile_name = "P1".into();
    row.operation_type = Some(OperationType::Install);
    row.status = ProfileStatus::Pending;
    row.command_uuid = "cmd-p1".into();
    profiles::bulk_upsert_status(&conn, &config, &cancel, &[row.clone()]).expect("mark pending");

    assert!(profiles::compute_install_set(&conn, None).expect("install set").is_empty());
    assert_eq!(commands::get_pending(&conn, "dev-H1").expect("pending").len(), 1);

    // =========================================================
    // Step 4: device acknowledges
    // =========================================================
    let response = DeviceResponse::new(
        b"<SyncML><Status>200</Status></SyncML>".to_vec(),
        vec![ProtocolOp::status("cmd-p1", "200").with_class(CommandClass::Atomic)],
    );
    let report =
        responses::save_response(&conn, &config, &cancel, "dev-H1", &response).expect("save");
    assert_eq!(report.matched, vec!["cmd-p1".to_string()]);
    assert_eq!(report.profiles_updated, 1);
    assert!(commands::get_pending(&conn, "dev-H1").expect("pending").is_empty());

    let view = profiles::host_view(&conn, "H1").expect("host view");
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].status, DeliveryStatus::Verifying);
    assert_eq!(view[0].detail, "");

    let results = commands::results_for_command(&conn, "cmd-p1").expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status.as_deref(), Some("200"));

    // =========================================================
    // Step 5: verification
    // =========================================================
    row.status = ProfileStatus::Verified;
    profiles::bulk_upsert_status(&conn, &config, &cancel, &[row]).expect("mark verified");
    let grace = config.disk_encryption.grace_period();
    let counts = summary::profiles_summary(&conn, &cancel, Some(1), grace).expect("summary");
    assert_eq!(
        counts,
        ProfilesSummary {
            verified: 1,
            ..Default::default()
        }
    );

    // =========================================================
    // Step 6: team change removes the profile
    // =========================================================
    hosts::set_team(&conn, h1, Some(2)).expect("move host");
    let remove = profiles::compute_remove_set(&conn, None).expect("remove set");
    assert_eq!(remove.len(), 1);
    assert_eq!(remove[0].profile_uuid, p1.profile_uuid);
    assert!(profiles::compute_install_set(&conn, None).expect("install set").is_empty());

    let applied = profiles::apply_pending(&conn, &config, &cancel, None).expect("apply");
    assert_eq!(applied.deleted, 1);
    assert!(host_rows(&conn, "H1").is_empty());
    assert!(profiles::host_view(&conn, "H1").expect("host view").is_empty());
}

#[test]
fn reconcile_is_idempotent_and_partitions_pairs() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (conn, config) = open_store(&dir);
    let cancel = CancelToken::new();

    profiles::create(&conn, None, "A", b"a").expect("A");
    profiles::create(&conn, None, "B", b"b").expect("B");
    let team_only = profiles::create(&conn, Some(7), "C", b"c").expect("C");
    enrolled_host(&conn, "H1", None);
    enrolled_host(&conn, "H2", None);
    enrolled_host(&conn, "H3", Some(7));

    let first = profiles::apply_pending(&conn, &config, &cancel, None).expect("apply");
    assert_eq!(first.upserted, 5);
    assert_eq!(first.deleted, 0);

    let snapshot: Vec<_> = ["H1", "H2", "H3"].iter().map(|h| host_rows(&conn, h)).collect();
    let second = profiles::apply_pending(&conn, &config, &cancel, None).expect("apply again");
    assert_eq!(second.deleted, 0);
    let after: Vec<_> = ["H1", "H2", "H3"].iter().map(|h| host_rows(&conn, h)).collect();
    assert_eq!(snapshot, after);

    // Deleting a profile moves its rows to the remove set, and nothing
    // is in both sets.
    profiles::delete(&conn, &team_only.profile_uuid).expect("delete");
    let install = profiles::compute_install_set(&conn, None).expect("install set");
    let remove = profiles::compute_remove_set(&conn, None).expect("remove set");
    assert_eq!(remove.len(), 1);
    assert_eq!(remove[0].host_uuid, "H3");
    for r in &remove {
        assert!(!install.iter().any(|i| i.key() == r.key()));
    }

    let applied = profiles::apply_pending(&conn, &config, &cancel, None).expect("apply");
    assert_eq!(applied.deleted, 1);
    assert!(host_rows(&conn, "H3").is_empty());
}

#[test]
fn converged_state_does_not_depend_on_batch_size() {
    let converge = |batch_size: usize| {
        let dir = tempfile::tempdir().expect("temp dir");
        let (conn, mut config) = open_store(&dir);
        config.batch.upsert_batch_size = batch_size;
        config.batch.delete_batch_size = batch_size;
        let cancel = CancelToken::new();

        for name in ["A", "B", "C"] {
            profiles::create(&conn, None, name, name.as_bytes()).expect("profile");
        }
        for host in ["H1", "H2", "H3", "H4"] {
            enrolled_host(&conn, host, None);
        }
        profiles::apply_pending(&conn, &config, &cancel, None).expect("apply");

        let h4 = hosts::get_by_uuid(&conn, "H4").expect("H4");
        hosts::set_team(&conn, h4.id, Some(9)).expect("move");
        profiles::apply_pending(&conn, &config, &cancel, None).expect("apply");

        ["H1", "H2", "H3", "H4"]
            .iter()
            .map(|h| host_rows(&conn, h))
            .collect::<Vec<_>>()
    };

    let one = converge(1);
    assert_eq!(one, converge(2));
    assert_eq!(one, converge(1000));
    assert_eq!(one[0].len(), 3);
    assert!(one[3].is_empty());
}

#[test]
fn content_change_redispatches_installed_profile() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (conn, config) = open_store(&dir);
    let cancel = CancelToken::new();

    let profile = profiles::create(&conn, None, "P", b"v1").expect("profile");
    enrolled_host(&conn, "H1", None);
    profiles::apply_pending(&conn, &config, &cancel, None).expect("apply");

    let mut row = profiles::compute_install_set(&conn, None).expect("install set").remove(0);
    row.operation_type = Some(OperationType::Install);
    row.status = ProfileStatus::Verified;
    row.command_uuid = "cmd-1".into();
    profiles::bulk_upsert_status(&conn, &config, &cancel, &[row]).expect("verified");
    assert!(profiles::compute_install_set(&conn, None).expect("install set").is_empty());

    profiles::update_content(&conn, &config, &cancel, &profile.profile_uuid, b"v1")
        .expect("same content");
    assert!(profiles::compute_install_set(&conn, None).expect("install set").is_empty());

    profiles::update_content(&conn, &config, &cancel, &profile.profile_uuid, b"v2")
        .expect("new content");
    let install = profiles::compute_install_set(&conn, None).expect("install set");
    assert_eq!(install.len(), 1);
    assert_eq!(install[0].status, ProfileStatus::NotDispatched);
    assert_eq!(install[0].command_uuid, "");
}
