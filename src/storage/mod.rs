//! Execution history and flaky test storage -- SQLite pool, schema, in-memory store.

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use crate::flaky::{ExecutionRecord, FlakyError, FlakyTestRecord, FlakyTestUpdate, NewExecution};
use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use uuid::Uuid;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA busy_timeout = 5000;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// An appended execution together with what was derived from it in the same
/// write transaction.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub execution: ExecutionRecord,
    /// Full history of the test case, newest first, including `execution`.
    pub history: Vec<ExecutionRecord>,
    /// The flaky record written for this history, if `assess` asked for one.
    pub flaky_test: Option<FlakyTestRecord>,
}

/// Append-only execution history plus the flaky test records derived from it.
///
/// Implementations are cheap to clone and are called from blocking contexts.
pub trait ExecutionStore: Clone + Send + Sync + 'static {
    /// Append an execution, read the full history of its test case and apply
    /// the flaky update returned by `assess`, all under one write lock so
    /// concurrent records for a test case are serialized.
    fn record_execution<F>(&self, execution: NewExecution, assess: F) -> Result<Recorded, FlakyError>
    where
        F: FnOnce(&[ExecutionRecord]) -> Option<FlakyTestUpdate>;

    /// All executions of a test case, newest first.
    fn executions_for(&self, test_case_id: &str) -> Result<Vec<ExecutionRecord>, FlakyError>;

    /// Number of distinct test cases with at least one execution.
    fn count_test_cases(&self) -> Result<u64, FlakyError>;

    fn flaky_by_id(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError>;

    /// Unresolved flaky records, highest score first.
    fn list_unresolved_flaky(&self) -> Result<Vec<FlakyTestRecord>, FlakyError>;

    /// Flip the resolved flag. `None` when the id is unknown.
    fn mark_resolved(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError>;
}

/// Store selected by configuration.
#[derive(Clone)]
pub enum Store {
    Sqlite(SqliteStore),
    Memory(MemoryStore),
}

impl Store {
    pub fn open(config: &crate::config::StorageConfig) -> Result<Self> {
        if config.in_memory {
            tracing::info!("Using in-memory storage");
            return Ok(Store::Memory(MemoryStore::new()));
        }
        tracing::info!(db_path = %config.database_path, "Initializing database");
        let pool = open_pool(&config.database_path)?;
        Ok(Store::Sqlite(SqliteStore::new(pool)))
    }
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Store::Sqlite($store) => $call,
            Store::Memory($store) => $call,
        }
    };
}

impl ExecutionStore for Store {
    fn record_execution<F>(&self, execution: NewExecution, assess: F) -> Result<Recorded, FlakyError>
    where
        F: FnOnce(&[ExecutionRecord]) -> Option<FlakyTestUpdate>,
    {
        dispatch!(self, s => s.record_execution(execution, assess))
    }

    fn executions_for(&self, test_case_id: &str) -> Result<Vec<ExecutionRecord>, FlakyError> {
        dispatch!(self, s => s.executions_for(test_case_id))
    }

    fn count_test_cases(&self) -> Result<u64, FlakyError> {
        dispatch!(self, s => s.count_test_cases())
    }

    fn flaky_by_id(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError> {
        dispatch!(self, s => s.flaky_by_id(id))
    }

    fn list_unresolved_flaky(&self) -> Result<Vec<FlakyTestRecord>, FlakyError> {
        dispatch!(self, s => s.list_unresolved_flaky())
    }

    fn mark_resolved(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError> {
        dispatch!(self, s => s.mark_resolved(id))
    }
}
