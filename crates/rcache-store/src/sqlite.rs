//! SQLite backend.
//!
//! Records live in one table keyed by `(kind, key)`; the used-key journal
//! lives in a second. Concurrent writers from other processes are
//! serialized by SQLite's own locking; a busy database makes the caller
//! wait indefinitely instead of failing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rcache_error::{RcacheError, Result};
use rcache_types::RecordKind;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, warn};

use crate::backend::Backend;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        kind TEXT NOT NULL,
        key  TEXT NOT NULL,
        body BLOB NOT NULL,
        PRIMARY KEY (kind, key)
    );
    CREATE TABLE IF NOT EXISTS used_keys (
        kind TEXT NOT NULL,
        key  TEXT NOT NULL,
        PRIMARY KEY (kind, key)
    );
";

const BUSY_RETRY: Duration = Duration::from_millis(10);

/// [`Backend`] storing records in a SQLite database file.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path).map_err(sql_error)?;
        conn.busy_handler(Some(wait_while_busy as fn(i32) -> bool)).map_err(sql_error)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(sql_error)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(sql_error)?;
        if version > SCHEMA_VERSION {
            return Err(RcacheError::storage(format!(
                "{}: schema version {version} is newer than supported {SCHEMA_VERSION}",
                path.display()
            )));
        }
        conn.execute_batch(SCHEMA).map_err(sql_error)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
            .map_err(sql_error)?;

        debug!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn wait_while_busy(attempt: i32) -> bool {
    if attempt == 0 {
        warn!("sqlite store busy, waiting");
    }
    std::thread::sleep(BUSY_RETRY);
    true
}

fn sql_error(err: rusqlite::Error) -> RcacheError {
    RcacheError::storage(format!("sqlite: {err}"))
}

impl Backend for SqliteBackend {
    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn put(&self, kind: RecordKind, key: &str, record: &[u8]) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO records (kind, key, body) VALUES (?1, ?2, ?3)",
                params![kind.label(), key, record],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    fn get(&self, kind: RecordKind, key: &str) -> Result<Option<Vec<u8>>> {
        self.conn
            .lock()
            .query_row(
                "SELECT body FROM records WHERE kind = ?1 AND key = ?2",
                params![kind.label(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM records WHERE kind = ?1 AND key = ?2",
                params![kind.label(), key],
            )
            .map_err(sql_error)?;
        Ok(changed > 0)
    }

    fn contains(&self, kind: RecordKind, key: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT 1 FROM records WHERE kind = ?1 AND key = ?2",
                params![kind.label(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        Ok(found.is_some())
    }

    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key FROM records WHERE kind = ?1 ORDER BY key")
            .map_err(sql_error)?;
        let rows = stmt
            .query_map(params![kind.label()], |row| row.get::<_, String>(0))
            .map_err(sql_error)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(sql_error)
    }

    fn mark_used(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO used_keys (kind, key) VALUES (?1, ?2)",
                params![kind.label(), key],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    fn list_used(&self, kind: RecordKind) -> Result<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key FROM used_keys WHERE kind = ?1")
            .map_err(sql_error)?;
        let rows = stmt
            .query_map(params![kind.label()], |row| row.get::<_, String>(0))
            .map_err(sql_error)?;
        rows.collect::<std::result::Result<BTreeSet<_>, _>>()
            .map_err(sql_error)
    }

    fn reset_used(&self) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM used_keys", [])
            .map_err(sql_error)?;
        Ok(())
    }

    fn mark_used_all(&self, kind: RecordKind, keys: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        {
            let mut stmt = tx
                .prepare("INSERT OR IGNORE INTO used_keys (kind, key) VALUES (?1, ?2)")
                .map_err(sql_error)?;
            for key in keys {
                stmt.execute(params![kind.label(), key]).map_err(sql_error)?;
            }
        }
        tx.commit().map_err(sql_error)
    }

    fn get_run(&self, kind: RecordKind, key_for: &dyn Fn(u32) -> String) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.lock();
        // One read transaction pins a single WAL snapshot for the whole run.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(sql_error)?;
        let mut records = Vec::new();
        {
            let mut stmt = tx
                .prepare("SELECT body FROM records WHERE kind = ?1 AND key = ?2")
                .map_err(sql_error)?;
            for number in 0_u32.. {
                let body: Option<Vec<u8>> = stmt
                    .query_row(params![kind.label(), key_for(number)], |row| row.get(0))
                    .optional()
                    .map_err(sql_error)?;
                match body {
                    Some(body) => records.push(body),
                    None => break,
                }
            }
        }
        tx.commit().map_err(sql_error)?;
        Ok(records)
    }

    fn replace_run(
        &self,
        kind: RecordKind,
        key_for: &dyn Fn(u32) -> String,
        fresh: &[(String, Vec<u8>)],
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        let mut removed = 0;
        for number in 0_u32.. {
            let changed = tx
                .execute(
                    "DELETE FROM records WHERE kind = ?1 AND key = ?2",
                    params![kind.label(), key_for(number)],
                )
                .map_err(sql_error)?;
            if changed == 0 {
                break;
            }
            removed += changed;
        }
        for (key, record) in fresh {
            tx.execute(
                "INSERT OR REPLACE INTO records (kind, key, body) VALUES (?1, ?2, ?3)",
                params![kind.label(), key, record],
            )
            .map_err(sql_error)?;
        }
        tx.commit().map_err(sql_error)?;
        Ok(removed)
    }
}
