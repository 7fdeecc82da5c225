//! Device enrollment records.

use serde::{Deserialize, Serialize};

/// A device enrolled in Windows MDM.
///
/// `hardware_id` is the upsert key; `device_id` is what the device presents
/// on every management session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolledDevice {
    /// Storage row id. Zero until persisted.
    #[serde(default)]
    pub id: i64,
    pub device_id: String,
    pub hardware_id: String,
    pub device_state: String,
    pub device_type: String,
    pub device_name: String,
    pub enroll_type: String,
    pub enroll_user_id: String,
    pub enroll_proto_version: String,
    pub enroll_client_version: String,
    pub not_in_oobe: bool,
    /// Host identity, set once the device has been matched to a host.
    pub host_uuid: Option<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl EnrolledDevice {
    /// A minimal enrollment with the two identifiers set and every other
    /// field empty.
    pub fn new(device_id: impl Into<String>, hardware_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            device_id: device_id.into(),
            hardware_id: hardware_id.into(),
            device_state: String::new(),
            device_type: String::new(),
            device_name: String::new(),
            enroll_type: String::new(),
            enroll_user_id: String::new(),
            enroll_proto_version: String::new(),
            enroll_client_version: String::new(),
            not_in_oobe: false,
            host_uuid: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}
