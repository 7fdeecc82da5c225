//! Configuration profiles and per-host delivery state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::{ParseError, TeamId};

/// A configuration profile scoped to a team (or to no team).
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigProfile {
    pub profile_uuid: String,
    pub team_id: TeamId,
    /// Unique within the team.
    pub name: String,
    /// Opaque profile body; never inspected by this store.
    #[serde_as(as = "Hex")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// Whether a host profile row tracks an install or a removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Install,
    Remove,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Remove => "remove",
        }
    }
}

impl FromStr for OperationType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "remove" => Ok(Self::Remove),
            other => Err(ParseError::new("operation type", other)),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of one profile on one host.
///
/// `NotDispatched` means no command has been sent yet (stored as NULL) and
/// is distinct from `Pending`, which means a command is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    #[default]
    NotDispatched,
    Pending,
    Verifying,
    Verified,
    Failed,
}

impl ProfileStatus {
    /// Column value. `None` for `NotDispatched`.
    pub fn as_column(self) -> Option<&'static str> {
        match self {
            Self::NotDispatched => None,
            Self::Pending => Some("pending"),
            Self::Verifying => Some("verifying"),
            Self::Verified => Some("verified"),
            Self::Failed => Some("failed"),
        }
    }

    pub fn from_column(value: Option<&str>) -> Result<Self, ParseError> {
        match value {
            None => Ok(Self::NotDispatched),
            Some("pending") => Ok(Self::Pending),
            Some("verifying") => Ok(Self::Verifying),
            Some("verified") => Ok(Self::Verified),
            Some("failed") => Ok(Self::Failed),
            Some(other) => Err(ParseError::new("profile status", other)),
        }
    }

    /// The status as reported outside the store. Not-yet-sent reads as
    /// pending.
    pub fn delivery(self) -> DeliveryStatus {
        match self {
            Self::NotDispatched | Self::Pending => DeliveryStatus::Pending,
            Self::Verifying => DeliveryStatus::Verifying,
            Self::Verified => DeliveryStatus::Verified,
            Self::Failed => DeliveryStatus::Failed,
        }
    }
}

/// Externally visible delivery status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Failed,
    Pending,
    Verifying,
    Verified,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            "verifying" => Ok(Self::Verifying),
            "verified" => Ok(Self::Verified),
            other => Err(ParseError::new("delivery status", other)),
        }
    }
}

/// A (profile, host) convergence row, as read from or written to the host
/// profile table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfilePayload {
    pub profile_uuid: String,
    pub host_uuid: String,
    pub profile_name: String,
    pub operation_type: Option<OperationType>,
    pub status: ProfileStatus,
    pub detail: String,
    /// Command that carried the last delivery attempt. Empty when none.
    pub command_uuid: String,
}

impl HostProfilePayload {
    /// A row for `profile_uuid` on `host_uuid` with nothing dispatched.
    pub fn new(profile_uuid: impl Into<String>, host_uuid: impl Into<String>) -> Self {
        Self {
            profile_uuid: profile_uuid.into(),
            host_uuid: host_uuid.into(),
            profile_name: String::new(),
            operation_type: None,
            status: ProfileStatus::NotDispatched,
            detail: String::new(),
            command_uuid: String::new(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.profile_uuid, &self.host_uuid)
    }
}

/// A profile as shown on a host's detail view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfileView {
    pub profile_uuid: String,
    pub name: String,
    pub status: DeliveryStatus,
    pub operation_type: Option<OperationType>,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_column_mapping() {
        for status in [
            ProfileStatus::NotDispatched,
            ProfileStatus::Pending,
            ProfileStatus::Verifying,
            ProfileStatus::Verified,
            ProfileStatus::Failed,
        ] {
            assert_eq!(ProfileStatus::from_column(status.as_column()), Ok(status));
        }
        assert_eq!(ProfileStatus::NotDispatched.as_column(), None);
    }

    #[test]
    fn test_not_dispatched_reads_as_pending() {
        assert_eq!(ProfileStatus::NotDispatched.delivery(), DeliveryStatus::Pending);
        assert_ne!(ProfileStatus::NotDispatched, ProfileStatus::Pending);
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(ProfileStatus::from_column(Some("acknowledged")).is_err());
        assert!("reinstall".parse::<OperationType>().is_err());
    }
}
