//! Lazily prepared statements owned by an adapter.

use super::StatementKind;
use crate::error::CoreResult;
use parking_lot::Mutex;
use tabula_storage::{DatabaseStatement, DatabaseWrapper};

/// One slot per [`StatementKind`], each filled on first use.
///
/// Statements are bound to the handle they were compiled against, so the
/// lifecycle controller releases every slot before a handle is closed.
#[derive(Default)]
pub struct StatementCache {
    slots: [Mutex<Option<Box<dyn DatabaseStatement>>>; 4],
}

impl StatementCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the statement of `kind`, compiling it first if needed.
    ///
    /// Bindings are cleared before `f` runs.
    pub fn with_statement<T>(
        &self,
        kind: StatementKind,
        db: &dyn DatabaseWrapper,
        sql: impl FnOnce() -> CoreResult<String>,
        f: impl FnOnce(&mut dyn DatabaseStatement) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut slot = self.slots[kind.slot()].lock();
        let statement = match slot.take() {
            Some(statement) if !statement.is_closed() => slot.insert(statement),
            _ => slot.insert(db.compile_statement(&sql()?)?),
        };
        statement.clear_bindings();
        f(&mut **statement)
    }

    /// Returns true if a statement of `kind` is currently prepared.
    #[must_use]
    pub fn is_prepared(&self, kind: StatementKind) -> bool {
        self.slots[kind.slot()].lock().is_some()
    }

    /// Closes and drops the statement of `kind`.
    ///
    /// Returns whether a statement was prepared.
    pub fn release(&self, kind: StatementKind) -> bool {
        match self.slots[kind.slot()].lock().take() {
            Some(mut statement) => {
                statement.close();
                true
            }
            None => false,
        }
    }

    /// Releases every slot.
    pub fn release_all(&self) {
        for kind in StatementKind::ALL {
            self.release(kind);
        }
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prepared: Vec<_> = StatementKind::ALL
            .into_iter()
            .filter(|kind| self.is_prepared(*kind))
            .collect();
        f.debug_struct("StatementCache")
            .field("prepared", &prepared)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_storage::{SqlValue, SqliteDatabase};

    fn db() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (v INTEGER);").unwrap();
        db
    }

    fn insert(cache: &StatementCache, db: &SqliteDatabase, v: i64) -> i64 {
        cache
            .with_statement(
                StatementKind::Insert,
                db,
                || Ok("INSERT INTO t (v) VALUES (?1)".to_string()),
                |stmt| {
                    stmt.bind(1, SqlValue::Integer(v))?;
                    Ok(stmt.execute_insert()?)
                },
            )
            .unwrap()
    }

    #[test]
    fn compiles_once_and_reuses() {
        let db = db();
        let cache = StatementCache::new();
        assert!(!cache.is_prepared(StatementKind::Insert));

        insert(&cache, &db, 1);
        assert!(cache.is_prepared(StatementKind::Insert));

        let mut compiled = 0;
        cache
            .with_statement(
                StatementKind::Insert,
                &db,
                || {
                    compiled += 1;
                    Ok(String::new())
                },
                |stmt| {
                    stmt.bind(1, SqlValue::Integer(2))?;
                    Ok(stmt.execute_insert()?)
                },
            )
            .unwrap();
        assert_eq!(compiled, 0);
    }

    #[test]
    fn release_closes_and_empties() {
        let db = db();
        let cache = StatementCache::new();
        insert(&cache, &db, 1);

        assert!(cache.release(StatementKind::Insert));
        assert!(!cache.release(StatementKind::Insert));
        assert!(!cache.is_prepared(StatementKind::Insert));

        // Next use recompiles transparently.
        insert(&cache, &db, 2);
        assert!(cache.is_prepared(StatementKind::Insert));
    }

    #[test]
    fn release_all_empties_every_slot() {
        let db = db();
        let cache = StatementCache::new();
        insert(&cache, &db, 1);
        cache
            .with_statement(
                StatementKind::Delete,
                &db,
                || Ok("DELETE FROM t".to_string()),
                |stmt| Ok(stmt.execute_update_delete()?),
            )
            .unwrap();

        cache.release_all();
        for kind in StatementKind::ALL {
            assert!(!cache.is_prepared(kind));
        }
    }
}
