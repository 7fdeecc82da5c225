//! Integration test crate for the Windows MDM store.
//!
//! This crate has no library code. Its tests drive the store the way the
//! management server does: profiles are reconciled onto hosts, delivered as
//! commands, answered by devices, and summarized.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p winmdm-integration-tests
//! ```
