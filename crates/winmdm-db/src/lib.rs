//! # winmdm-db
//!
//! Persistence and reconciliation core for Windows MDM.
//!
//! The store tracks device enrollments, queues management commands per
//! device, correlates device responses back to those commands, reconciles
//! desired configuration profiles against per-host delivery state, and
//! classifies disk-encryption compliance.
//!
//! ## Conventions
//!
//! - The storage handle is a `&rusqlite::Connection` passed to every
//!   operation. A `Transaction` derefs to a `Connection`, so helpers work
//!   inside or outside a unit of work.
//! - Multi-row writes run under [`tx::with_retry_tx`] and take a
//!   [`CancelToken`].
//! - All timestamps are Unix epoch seconds.
//! - Schema version stored in `PRAGMA user_version`.

pub mod batch;
pub mod cancel;
pub mod config;
pub mod migrations;
pub mod queries;
pub mod schema;
pub mod tx;

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};

pub use cancel::CancelToken;
pub use config::StoreConfig;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{context}: {source}")]
    Internal {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Wrap a driver error with the operation that produced it.
    pub fn internal(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Internal {
            context: context.into(),
            source,
        }
    }

    /// The underlying driver error, if any.
    pub fn sqlite(&self) -> Option<&rusqlite::Error> {
        match self {
            Self::Sqlite(e) | Self::Internal { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Busy or locked database: the unit of work may succeed if re-run.
    ///
    /// Constraint violations are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.sqlite().and_then(rusqlite::Error::sqlite_error_code),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

/// True for UNIQUE and PRIMARY KEY violations.
pub(crate) fn is_duplicate(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}

/// Attach operation context to driver errors.
pub trait ResultExt<T> {
    /// Wrap any driver error as [`DbError::Internal`].
    fn context(self, context: &str) -> Result<T>;

    /// Like [`ResultExt::context`], but map duplicate-key violations to
    /// [`DbError::AlreadyExists`] naming `what`.
    fn or_exists(self, what: impl FnOnce() -> String, context: &str) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| DbError::internal(context, e))
    }

    fn or_exists(self, what: impl FnOnce() -> String, context: &str) -> Result<T> {
        self.map_err(|e| {
            if is_duplicate(&e) {
                DbError::AlreadyExists(what())
            } else {
                DbError::internal(context, e)
            }
        })
    }
}

/// Surface a column parse failure as a driver conversion error, so it can be
/// returned from a row-mapping closure.
pub(crate) fn parse_column<T, E>(index: usize, parsed: std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    parsed.map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Current Unix time in seconds.
pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Open or create the database at the given path.
///
/// Configures WAL mode, foreign keys, and runs any pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    open_with_timeout(path, Duration::from_millis(config::default_busy_timeout_ms()))
}

/// Open the database described by `config`.
pub fn open_with_config(config: &StoreConfig) -> Result<Connection> {
    open_with_timeout(&config.database_path(), config.database.busy_timeout())
}

fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn, busy_timeout)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn, Duration::from_millis(config::default_busy_timeout_ms()))?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;",
    )?;
    Ok(())
}
