//! # winmdm-types
//!
//! Shared domain types for the Windows MDM state store.
//!
//! Every persisted enum has a stable lowercase string form (`as_str` /
//! `FromStr`) which is what the database columns hold.

pub mod command;
pub mod disk_encryption;
pub mod enrollment;
pub mod host;
pub mod profile;
pub mod protocol;
pub mod summary;

/// Team scope. `None` and `Some(0)` both mean "no team".
pub type TeamId = Option<u32>;

/// Platform string of hosts managed by this store.
pub const PLATFORM_WINDOWS: &str = "windows";

/// Default grace window, in seconds, during which a not-yet-encrypted disk
/// observation after a key update counts as in progress.
pub const DEFAULT_DISK_ENCRYPTION_GRACE_SECS: u64 = 3600;

/// Normalise a team scope to the stored integer (0 = no team).
pub fn team_scope(team_id: TeamId) -> u32 {
    team_id.unwrap_or(0)
}

/// Error returned when a persisted string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_scope() {
        assert_eq!(team_scope(None), 0);
        assert_eq!(team_scope(Some(0)), 0);
        assert_eq!(team_scope(Some(7)), 7);
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("profile status", "bogus");
        assert_eq!(err.to_string(), "unknown profile status: \"bogus\"");
    }
}
