//! Per-bucket ordered key-value store.
//!
//! Each bucket is a single SQLite file (`<bucket>.kv`) holding one
//! `kv(key BLOB PRIMARY KEY, val BLOB)` table.  BLOB primary keys
//! compare with memcmp, which gives the byte-ordered iteration the
//! listing contract needs.
//!
//! The connection sits behind an async mutex: a PUT's transaction must
//! stay open across the blob upload await, and the mutex serializes
//! same-bucket operations in the meantime.

use std::path::Path;

use anyhow::Context;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};

/// One bucket's key-value database.
pub struct KvDb {
    conn: Mutex<Connection>,
}

impl KvDb {
    /// Create a new database file (also used for pre-existing paths at
    /// bucket re-creation, which is idempotent).
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("error creating bucket db {}", path.display()))?;
        Self::init(conn)
    }

    /// Open an existing database file.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .with_context(|| format!("error opening bucket db {}", path.display()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                val BLOB NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The smallest key, or `None` when the bucket is empty.
    pub async fn first_key(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let key = conn
            .query_row("SELECT key FROM kv ORDER BY key LIMIT 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(key)
    }

    /// Read one value.
    pub async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let val = conn
            .query_row("SELECT val FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(val)
    }

    /// Visit every row in key order.  The callback returns `false` to
    /// stop early (a full listing page).
    pub async fn for_each(
        &self,
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT key, val FROM kv ORDER BY key")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let val: Vec<u8> = row.get(1)?;
            if !visit(&key, &val) {
                break;
            }
        }
        Ok(())
    }

    /// Start a transaction.  The returned handle keeps the bucket
    /// locked until committed, rolled back, or dropped (drop rolls
    /// back, so an aborted request cannot leave a row half-written).
    pub async fn begin(&self) -> anyhow::Result<KvTxn<'_>> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(KvTxn {
            conn,
            finished: false,
        })
    }
}

/// An open transaction on one bucket database.
pub struct KvTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl KvTxn<'_> {
    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let val = self
            .conn
            .query_row("SELECT val FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(val)
    }

    /// Insert or replace one row.
    pub fn set(&self, key: &[u8], val: &[u8]) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, val) VALUES (?1, ?2)",
            [key, val],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn commit(mut self) -> anyhow::Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> anyhow::Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for KvTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
