//! Retrying unit of work.

use std::thread;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::{CancelToken, Result, ResultExt};

/// How often, and how patiently, a unit of work is re-run after a transient
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff, capped at `max_delay`. `attempt` starts at 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `f` inside an IMMEDIATE transaction and commit.
///
/// If `f` or the commit fails with a transient error (busy / locked), the
/// transaction is rolled back and `f` runs again from scratch, so anything
/// `f` reads is re-read on every attempt. Any other error rolls back and is
/// returned as-is. `cancel` is checked before each attempt.
pub fn with_retry_tx<T, F>(
    conn: &Connection,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut(&Transaction<'_>) -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        cancel.check()?;

        match run_once(conn, &mut f) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying transaction after transient failure"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn run_once<T, F>(conn: &Connection, f: &mut F) -> Result<T>
where
    F: FnMut(&Transaction<'_>) -> Result<T>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .context("begin transaction")?;
    // Dropping `tx` without commit rolls back.
    let value = f(&tx)?;
    tx.commit().context("commit transaction")?;
    Ok(value)
}

/// A transient driver error, for exercising retry paths in tests.
#[cfg(test)]
pub(crate) fn busy_error() -> crate::DbError {
    crate::DbError::Sqlite(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".into()),
    ))
}
