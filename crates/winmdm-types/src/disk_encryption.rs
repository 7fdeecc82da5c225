//! Disk-encryption (BitLocker) compliance.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// Disk-encryption classification of a single host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskEncryptionStatus {
    Verified,
    Verifying,
    /// Reported externally as "pending".
    Enforcing,
    Failed,
}

impl DiskEncryptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Verifying => "verifying",
            Self::Enforcing => "enforcing",
            Self::Failed => "failed",
        }
    }

    /// Label used in host-level reports.
    pub fn external_label(self) -> &'static str {
        match self {
            Self::Enforcing => "pending",
            other => other.as_str(),
        }
    }
}

impl FromStr for DiskEncryptionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(Self::Verified),
            "verifying" => Ok(Self::Verifying),
            "enforcing" => Ok(Self::Enforcing),
            "failed" => Ok(Self::Failed),
            other => Err(ParseError::new("disk encryption status", other)),
        }
    }
}

impl fmt::Display for DiskEncryptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host's disk-encryption status plus the client error, if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDiskEncryption {
    pub status: DiskEncryptionStatus,
    pub detail: String,
}

/// Fleet-wide disk-encryption counts for one team scope.
///
/// `action_required` and `removing_enforcement` do not apply to Windows
/// hosts and are always zero; they exist so the shape matches other
/// platforms' summaries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskEncryptionSummary {
    pub verified: u64,
    pub verifying: u64,
    pub action_required: u64,
    pub enforcing: u64,
    pub failed: u64,
    pub removing_enforcement: u64,
}

impl DiskEncryptionSummary {
    pub fn total(&self) -> u64 {
        self.verified + self.verifying + self.enforcing + self.failed
    }
}
