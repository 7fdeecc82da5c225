//! Host inventory as seen by this store.
//!
//! Hosts are owned by the inventory service; the store only reads them to
//! compute desired state and compliance.

use serde::{Deserialize, Serialize};

use crate::TeamId;

/// A managed host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub uuid: String,
    pub team_id: TeamId,
    pub platform: String,
    /// Server editions have no disk-encryption status.
    pub is_server: bool,
}
