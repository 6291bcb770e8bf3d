//! SQLite implementation of the engine seam.

use crate::error::{StorageError, StorageResult};
use crate::value::{Row, SqlValue};
use crate::wrapper::{DatabaseStatement, DatabaseWrapper};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rusqlite::{params_from_iter, Connection, DatabaseName, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Connection plus transaction bookkeeping, guarded by one mutex.
struct Inner {
    conn: Option<Connection>,
    /// Thread that owns the open transaction, if any.
    owner: Option<ThreadId>,
    /// Success flag per nesting level.
    levels: Vec<bool>,
    /// Set once any level ended without success.
    failed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled whenever a transaction owner releases the connection.
    turn: Condvar,
    path: Option<PathBuf>,
}

impl Shared {
    /// Locks the connection, waiting while another thread owns a transaction.
    fn lock_turn(&self) -> MutexGuard<'_, Inner> {
        let me = thread::current().id();
        let mut inner = self.inner.lock();
        while matches!(inner.owner, Some(owner) if owner != me) {
            self.turn.wait(&mut inner);
        }
        inner
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> StorageResult<T> {
        let inner = self.lock_turn();
        let conn = inner.conn.as_ref().ok_or(StorageError::Closed)?;
        Ok(f(conn)?)
    }
}

/// A SQLite database session.
///
/// One connection is shared by every caller. A thread that begins a
/// transaction owns the connection until its outermost `end_transaction`;
/// other threads block until then, so statements from different threads
/// never leak into each other's transactions.
///
/// # Example
///
/// ```no_run
/// use tabula_storage::{DatabaseWrapper, SqliteDatabase};
/// use std::path::Path;
///
/// let db = SqliteDatabase::open(Path::new("app.db")).unwrap();
/// db.begin_transaction().unwrap();
/// db.execute("CREATE TABLE IF NOT EXISTS notes (body TEXT)", &[]).unwrap();
/// db.set_transaction_successful().unwrap();
/// db.end_transaction().unwrap();
/// ```
#[derive(Clone)]
pub struct SqliteDatabase {
    shared: Arc<Shared>,
}

impl SqliteDatabase {
    /// Opens or creates a database file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or the file cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn, Some(path.to_path_buf())))
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    conn: Some(conn),
                    owner: None,
                    levels: Vec::new(),
                    failed: false,
                }),
                turn: Condvar::new(),
                path,
            }),
        }
    }

    /// Returns the database file path. `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    /// Returns true until [`close`](Self::close) succeeds.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.inner.lock().conn.is_some()
    }

    /// Runs a multi-statement SQL script.
    pub fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        self.shared.with_conn(|conn| conn.execute_batch(sql))
    }

    /// Enables or disables foreign-key enforcement.
    pub fn set_foreign_keys(&self, enabled: bool) -> StorageResult<()> {
        let value = if enabled { "ON" } else { "OFF" };
        self.execute_batch(&format!("PRAGMA foreign_keys = {value};"))
    }

    /// Writes a consistent online copy of the database to `dst`.
    pub fn backup_to(&self, dst: &Path) -> StorageResult<()> {
        self.shared
            .with_conn(|conn| conn.backup(DatabaseName::Main, dst, None))
    }

    /// Closes the connection.
    ///
    /// Any open transaction is rolled back by the engine. Closing twice is a
    /// no-op.
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.shared.inner.lock();
        let Some(conn) = inner.conn.take() else {
            return Ok(());
        };
        inner.owner = None;
        inner.levels.clear();
        inner.failed = false;
        self.shared.turn.notify_all();
        drop(inner);

        conn.close().map_err(|(_, e)| StorageError::Engine(e))
    }
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.shared.path)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl DatabaseWrapper for SqliteDatabase {
    fn execute(&self, sql: &str, args: &[SqlValue]) -> StorageResult<usize> {
        self.shared
            .with_conn(|conn| conn.execute(sql, params_from_iter(args.iter())))
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> StorageResult<Vec<Row>> {
        self.shared.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let columns = stmt.column_count();
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(SqlValue::from))
                    .collect::<rusqlite::Result<Row>>()
            })?;
            let collected = rows.collect::<rusqlite::Result<Vec<Row>>>();
            collected
        })
    }

    fn compile_statement(&self, sql: &str) -> StorageResult<Box<dyn DatabaseStatement>> {
        // Validate now so broken SQL fails at compile time, not first use.
        self.shared.with_conn(|conn| conn.prepare_cached(sql).map(|_| ()))?;
        Ok(Box::new(SqliteStatement {
            shared: Arc::clone(&self.shared),
            sql: sql.to_string(),
            bindings: Vec::new(),
            closed: false,
        }))
    }

    fn begin_transaction(&self) -> StorageResult<()> {
        let mut inner = self.shared.lock_turn();
        if inner.levels.is_empty() {
            let conn = inner.conn.as_ref().ok_or(StorageError::Closed)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            inner.owner = Some(thread::current().id());
            inner.failed = false;
        }
        inner.levels.push(false);
        Ok(())
    }

    fn set_transaction_successful(&self) -> StorageResult<()> {
        let mut inner = self.shared.lock_turn();
        let level = inner.levels.last_mut().ok_or(StorageError::NoTransaction)?;
        *level = true;
        Ok(())
    }

    fn end_transaction(&self) -> StorageResult<()> {
        let mut inner = self.shared.lock_turn();
        let successful = inner.levels.pop().ok_or(StorageError::NoTransaction)?;
        if !successful {
            inner.failed = true;
        }
        if !inner.levels.is_empty() {
            return Ok(());
        }

        let finish = if inner.failed { "ROLLBACK" } else { "COMMIT" };
        inner.owner = None;
        inner.failed = false;
        let result = match inner.conn.as_ref() {
            Some(conn) => conn.execute_batch(finish).or_else(|e| {
                // A failed COMMIT can leave the engine transaction open.
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }),
            None => Ok(()),
        };
        self.shared.turn.notify_all();
        Ok(result?)
    }

    fn in_transaction(&self) -> bool {
        !self.shared.inner.lock().levels.is_empty()
    }

    fn version(&self) -> StorageResult<i64> {
        self.shared
            .with_conn(|conn| conn.query_row("PRAGMA user_version", [], |row| row.get(0)))
    }

    fn set_version(&self, version: i64) -> StorageResult<()> {
        self.execute_batch(&format!("PRAGMA user_version = {version};"))
    }

    fn integrity_ok(&self) -> StorageResult<bool> {
        let rows = self.query("PRAGMA quick_check", &[])?;
        Ok(rows.len() == 1 && rows[0].first().and_then(SqlValue::as_str) == Some("ok"))
    }
}

/// A compiled SQLite statement.
///
/// The statement keeps its SQL and bindings; the prepared form lives in the
/// connection's statement cache so reuse does not re-parse.
pub struct SqliteStatement {
    shared: Arc<Shared>,
    sql: String,
    bindings: Vec<SqlValue>,
    closed: bool,
}

impl SqliteStatement {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::StatementClosed {
                sql: self.sql.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn run<T>(
        &self,
        f: impl FnOnce(&Connection, &mut rusqlite::CachedStatement<'_>, &[SqlValue]) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        self.ensure_open()?;
        self.shared.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            f(conn, &mut stmt, &self.bindings)
        })
    }
}

impl DatabaseStatement for SqliteStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn bind(&mut self, index: usize, value: SqlValue) -> StorageResult<()> {
        self.ensure_open()?;
        if index == 0 {
            return Err(StorageError::InvalidBinding { index });
        }
        if self.bindings.len() < index {
            self.bindings.resize(index, SqlValue::Null);
        }
        self.bindings[index - 1] = value;
        Ok(())
    }

    fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    fn execute_insert(&mut self) -> StorageResult<i64> {
        self.run(|conn, stmt, args| {
            stmt.execute(params_from_iter(args.iter()))?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn execute_update_delete(&mut self) -> StorageResult<usize> {
        self.run(|_, stmt, args| stmt.execute(params_from_iter(args.iter())))
    }

    fn simple_query_for_long(&mut self) -> StorageResult<Option<i64>> {
        self.run(|_, stmt, args| {
            stmt.query_row(params_from_iter(args.iter()), |row| row.get::<_, Option<i64>>(0))
                .optional()
                .map(Option::flatten)
        })
    }

    fn close(&mut self) {
        self.closed = true;
        self.bindings.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn memory_db() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        db
    }

    fn count(db: &SqliteDatabase) -> i64 {
        db.query("SELECT COUNT(*) FROM items", &[]).unwrap()[0][0]
            .as_i64()
            .unwrap()
    }

    #[test]
    fn execute_and_query() {
        let db = memory_db();
        db.execute("INSERT INTO items (name) VALUES (?1)", &["a".into()])
            .unwrap();
        let rows = db.query("SELECT id, name FROM items", &[]).unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Integer(1), SqlValue::Text("a".into())]]);
    }

    #[test]
    fn committed_transaction_is_visible() {
        let db = memory_db();
        db.begin_transaction().unwrap();
        db.execute("INSERT INTO items (name) VALUES ('x')", &[]).unwrap();
        db.set_transaction_successful().unwrap();
        db.end_transaction().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn unsuccessful_transaction_rolls_back() {
        let db = memory_db();
        db.begin_transaction().unwrap();
        db.execute("INSERT INTO items (name) VALUES ('x')", &[]).unwrap();
        db.end_transaction().unwrap();

        assert_eq!(count(&db), 0);
    }

    #[test]
    fn failed_inner_level_rolls_back_outer() {
        let db = memory_db();
        db.begin_transaction().unwrap();
        db.execute("INSERT INTO items (name) VALUES ('outer')", &[]).unwrap();

        db.begin_transaction().unwrap();
        db.execute("INSERT INTO items (name) VALUES ('inner')", &[]).unwrap();
        db.end_transaction().unwrap();

        db.set_transaction_successful().unwrap();
        db.end_transaction().unwrap();

        assert_eq!(count(&db), 0);
    }

    #[test]
    fn unbalanced_end_is_an_error() {
        let db = memory_db();
        assert!(matches!(db.end_transaction(), Err(StorageError::NoTransaction)));
        assert!(matches!(
            db.set_transaction_successful(),
            Err(StorageError::NoTransaction)
        ));
    }

    #[test]
    fn statement_bind_and_reuse() {
        let db = memory_db();
        let mut insert = db
            .compile_statement("INSERT INTO items (name) VALUES (?1)")
            .unwrap();

        insert.bind(1, "first".into()).unwrap();
        assert_eq!(insert.execute_insert().unwrap(), 1);
        insert.bind(1, "second".into()).unwrap();
        assert_eq!(insert.execute_insert().unwrap(), 2);

        let mut total = db.compile_statement("SELECT COUNT(*) FROM items").unwrap();
        assert_eq!(total.simple_query_for_long().unwrap(), Some(2));
    }

    #[test]
    fn closed_statement_rejects_execution() {
        let db = memory_db();
        let mut stmt = db.compile_statement("DELETE FROM items").unwrap();
        stmt.close();
        assert!(stmt.is_closed());
        assert!(matches!(
            stmt.execute_update_delete(),
            Err(StorageError::StatementClosed { .. })
        ));
    }

    #[test]
    fn zero_binding_index_rejected() {
        let db = memory_db();
        let mut stmt = db
            .compile_statement("INSERT INTO items (name) VALUES (?1)")
            .unwrap();
        assert!(matches!(
            stmt.bind(0, SqlValue::Null),
            Err(StorageError::InvalidBinding { index: 0 })
        ));
    }

    #[test]
    fn invalid_sql_fails_at_compile() {
        let db = memory_db();
        assert!(db.compile_statement("SELEC nonsense").is_err());
    }

    #[test]
    fn version_round_trip() {
        let db = memory_db();
        assert_eq!(db.version().unwrap(), 0);
        db.set_version(4).unwrap();
        assert_eq!(db.version().unwrap(), 4);
    }

    #[test]
    fn integrity_check_on_healthy_db() {
        let db = memory_db();
        assert!(db.integrity_ok().unwrap());
    }

    #[test]
    fn close_is_idempotent_and_rejects_use() {
        let db = memory_db();
        db.close().unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.query("SELECT 1", &[]), Err(StorageError::Closed)));
    }

    #[test]
    fn file_database_persists_and_backs_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db");
        let backup = dir.path().join("app.backup.db");

        {
            let db = SqliteDatabase::open(&path).unwrap();
            db.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (11);")
                .unwrap();
            db.backup_to(&backup).unwrap();
            db.close().unwrap();
        }

        let copy = SqliteDatabase::open(&backup).unwrap();
        let rows = copy.query("SELECT v FROM t", &[]).unwrap();
        assert_eq!(rows[0][0], SqlValue::Integer(11));
    }

    #[test]
    fn transaction_excludes_other_threads() {
        let db = memory_db();
        db.begin_transaction().unwrap();
        db.execute("INSERT INTO items (name) VALUES ('held')", &[]).unwrap();

        let other = db.clone();
        let handle = std::thread::spawn(move || {
            // Blocks until the owning thread ends its transaction.
            other.execute("INSERT INTO items (name) VALUES ('later')", &[]).unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        db.end_transaction().unwrap();
        handle.join().unwrap();

        let rows = db.query("SELECT name FROM items", &[]).unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Text("later".into())]]);
    }
}
