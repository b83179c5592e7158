//! SQLite database handle with WAL mode and the single-table schema.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` so store calls never block the async
//! runtime.  The schema is one `items` table keyed `(PK, SK)` with the
//! three secondary index column pairs used by the repository queries.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Thread-safe handle to the message store database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path`, apply pragmas, and ensure the
    /// schema exists.
    ///
    /// Blocks briefly on file I/O; call during startup or wrap in
    /// `spawn_blocking`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening message store");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database — useful for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory message store");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a closure against the connection on the blocking pool.
    ///
    /// This is the only way repository code touches SQLite from async
    /// context.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    // ── schema & pragmas ─────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        // WAL: concurrent readers, non-blocking writes.  NORMAL sync is safe
        // with WAL — at worst the last transaction is lost, never corrupted.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (
                pk          TEXT NOT NULL,
                sk          TEXT NOT NULL,
                user_pk     TEXT,
                user_sk     TEXT,
                global_pk   TEXT,
                global_sk   TEXT,
                parent_pk   TEXT,
                parent_sk   TEXT,
                payload     TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (pk, sk)
            );
            CREATE INDEX IF NOT EXISTS user_data_index
                ON items (user_pk, user_sk);
            CREATE INDEX IF NOT EXISTS global_resource_index
                ON items (global_pk, global_sk);
            CREATE INDEX IF NOT EXISTS message_hierarchy_index
                ON items (parent_pk, parent_sk);",
        )?;

        debug!("message store schema ready");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
