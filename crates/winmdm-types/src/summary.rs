//! Fleet-wide OS settings summary.

use serde::{Deserialize, Serialize};

use crate::profile::DeliveryStatus;

/// Number of hosts in each OS settings bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilesSummary {
    pub failed: u64,
    pub pending: u64,
    pub verifying: u64,
    pub verified: u64,
}

impl ProfilesSummary {
    pub fn record(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Failed => self.failed += 1,
            DeliveryStatus::Pending => self.pending += 1,
            DeliveryStatus::Verifying => self.verifying += 1,
            DeliveryStatus::Verified => self.verified += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.failed + self.pending + self.verifying + self.verified
    }
}
