//! Database query functions organized by component.

pub mod commands;
pub mod disk_encryption;
pub mod enrollments;
pub mod hosts;
pub mod profiles;
pub mod responses;
pub mod summary;
