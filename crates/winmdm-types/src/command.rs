//! Management commands and their recorded results.

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

/// A management command. Immutable once created.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdmCommand {
    pub command_uuid: String,
    /// Opaque encoded command, delivered as-is by the transport.
    #[serde_as(as = "Hex")]
    pub raw_command: Vec<u8>,
    /// Configuration path the command targets.
    pub target_loc_uri: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl MdmCommand {
    pub fn new(
        command_uuid: impl Into<String>,
        raw_command: impl Into<Vec<u8>>,
        target_loc_uri: impl Into<String>,
    ) -> Self {
        Self {
            command_uuid: command_uuid.into(),
            raw_command: raw_command.into(),
            target_loc_uri: target_loc_uri.into(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// One host's outcome for a command, joined with the response it came in.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub host_uuid: Option<String>,
    pub command_uuid: String,
    /// Status code reported by the device, if any.
    pub status: Option<String>,
    /// The command's target path.
    pub request_type: String,
    /// Full raw response the result was extracted from.
    #[serde_as(as = "Hex")]
    pub result: Vec<u8>,
    pub updated_at: u64,
}
