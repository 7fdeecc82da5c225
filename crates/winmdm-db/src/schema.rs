//! SQL schema definitions.

/// Complete schema for the v1 database.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Host inventory (read-only inputs owned by other services)
-- ============================================================

CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    team_id INTEGER,
    platform TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_hosts_team ON hosts(team_id);

CREATE TABLE IF NOT EXISTS host_mdm (
    host_id INTEGER PRIMARY KEY REFERENCES hosts(id) ON DELETE CASCADE,
    enrolled INTEGER NOT NULL DEFAULT 0,
    is_server INTEGER
);

CREATE TABLE IF NOT EXISTS host_disk_encryption_keys (
    host_id INTEGER PRIMARY KEY REFERENCES hosts(id) ON DELETE CASCADE,
    base64_encrypted TEXT,
    decryptable INTEGER,
    client_error TEXT NOT NULL DEFAULT '',
    updated_at INTEGER
);

CREATE TABLE IF NOT EXISTS host_disks (
    host_id INTEGER PRIMARY KEY REFERENCES hosts(id) ON DELETE CASCADE,
    encrypted INTEGER,
    updated_at INTEGER
);

-- team_id 0 = no team
CREATE TABLE IF NOT EXISTS disk_encryption_settings (
    team_id INTEGER PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 0
);

-- ============================================================
-- Enrollments
-- ============================================================

CREATE TABLE IF NOT EXISTS mdm_enrollments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL UNIQUE,
    hardware_id TEXT NOT NULL UNIQUE,
    device_state TEXT NOT NULL DEFAULT '',
    device_type TEXT NOT NULL DEFAULT '',
    device_name TEXT NOT NULL DEFAULT '',
    enroll_type TEXT NOT NULL DEFAULT '',
    enroll_user_id TEXT NOT NULL DEFAULT '',
    enroll_proto_version TEXT NOT NULL DEFAULT '',
    enroll_client_version TEXT NOT NULL DEFAULT '',
    not_in_oobe INTEGER NOT NULL DEFAULT 0,
    host_uuid TEXT,
    created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    updated_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);

CREATE INDEX IF NOT EXISTS idx_enrollments_host ON mdm_enrollments(host_uuid);

-- ============================================================
-- Commands, queue, responses, results
-- ============================================================

CREATE TABLE IF NOT EXISTS mdm_commands (
    command_uuid TEXT PRIMARY KEY,
    raw_command BLOB NOT NULL,
    target_loc_uri TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    updated_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);

CREATE TABLE IF NOT EXISTS mdm_command_queue (
    enrollment_id INTEGER NOT NULL REFERENCES mdm_enrollments(id) ON DELETE CASCADE,
    command_uuid TEXT NOT NULL REFERENCES mdm_commands(command_uuid) ON DELETE CASCADE,
    created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    PRIMARY KEY (enrollment_id, command_uuid)
);

CREATE INDEX IF NOT EXISTS idx_queue_command ON mdm_command_queue(command_uuid);

-- append-only audit trail
CREATE TABLE IF NOT EXISTS mdm_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    enrollment_id INTEGER NOT NULL REFERENCES mdm_enrollments(id) ON DELETE CASCADE,
    raw_response BLOB NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);

CREATE TABLE IF NOT EXISTS mdm_command_results (
    enrollment_id INTEGER NOT NULL REFERENCES mdm_enrollments(id) ON DELETE CASCADE,
    command_uuid TEXT NOT NULL REFERENCES mdm_commands(command_uuid) ON DELETE CASCADE,
    raw_result BLOB,
    status_code TEXT,
    response_id INTEGER NOT NULL REFERENCES mdm_responses(id),
    created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    updated_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    PRIMARY KEY (enrollment_id, command_uuid)
);

CREATE INDEX IF NOT EXISTS idx_results_command ON mdm_command_results(command_uuid);

-- ============================================================
-- Configuration profiles
-- ============================================================

-- team_id 0 = no team
CREATE TABLE IF NOT EXISTS mdm_configuration_profiles (
    profile_uuid TEXT PRIMARY KEY,
    team_id INTEGER NOT NULL DEFAULT 0,
    name TEXT NOT NULL,
    content BLOB NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    updated_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    UNIQUE (team_id, name)
);

-- status NULL = not yet dispatched
CREATE TABLE IF NOT EXISTS host_mdm_profiles (
    profile_uuid TEXT NOT NULL,
    host_uuid TEXT NOT NULL,
    status TEXT CHECK (status IN ('pending', 'verifying', 'verified', 'failed')),
    operation_type TEXT CHECK (operation_type IN ('install', 'remove')),
    detail TEXT NOT NULL DEFAULT '',
    command_uuid TEXT NOT NULL DEFAULT '',
    profile_name TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (profile_uuid, host_uuid)
);

CREATE INDEX IF NOT EXISTS idx_host_profiles_command ON host_mdm_profiles(host_uuid, command_uuid);
"#;
