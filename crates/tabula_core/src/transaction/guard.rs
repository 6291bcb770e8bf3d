//! Scoped transaction.

use crate::error::CoreResult;
use tabula_storage::DatabaseWrapper;
use tracing::warn;

/// An open transaction that ends exactly once.
///
/// The transaction begins when the guard is created and ends when the guard
/// is consumed by [`end`](Self::end) or dropped. It commits only if
/// [`mark_successful`](Self::mark_successful) was called first; otherwise the
/// engine rolls it back.
///
/// # Example
///
/// ```rust,ignore
/// let mut guard = TransactionGuard::begin(db)?;
/// db.execute("DELETE FROM sessions", &[])?;
/// guard.mark_successful()?;
/// guard.end()?;
/// ```
#[must_use = "dropping the guard immediately ends the transaction"]
pub struct TransactionGuard<'a> {
    db: &'a dyn DatabaseWrapper,
    successful: bool,
    ended: bool,
}

impl<'a> TransactionGuard<'a> {
    /// Begins a transaction on `db`.
    pub fn begin(db: &'a dyn DatabaseWrapper) -> CoreResult<Self> {
        db.begin_transaction()?;
        Ok(Self {
            db,
            successful: false,
            ended: false,
        })
    }

    /// Marks the transaction successful so ending it commits.
    pub fn mark_successful(&mut self) -> CoreResult<()> {
        self.db.set_transaction_successful()?;
        self.successful = true;
        Ok(())
    }

    /// Returns true once the transaction was marked successful.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Ends the transaction, reporting commit failures.
    pub fn end(mut self) -> CoreResult<()> {
        self.ended = true;
        self.db.end_transaction()?;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Err(e) = self.db.end_transaction() {
            warn!(error = %e, "failed to end transaction");
        }
    }
}

impl std::fmt::Debug for TransactionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionGuard")
            .field("successful", &self.successful)
            .field("ended", &self.ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_storage::SqliteDatabase;

    fn db() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (v INTEGER);").unwrap();
        db
    }

    fn count(db: &SqliteDatabase) -> i64 {
        db.query("SELECT COUNT(*) FROM t", &[]).unwrap()[0][0]
            .as_i64()
            .unwrap()
    }

    #[test]
    fn commit_when_marked() {
        let db = db();
        let mut guard = TransactionGuard::begin(&db).unwrap();
        db.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        guard.mark_successful().unwrap();
        assert!(guard.is_successful());
        guard.end().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn drop_without_mark_rolls_back() {
        let db = db();
        {
            let _guard = TransactionGuard::begin(&db).unwrap();
            db.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        }
        assert!(!db.in_transaction());
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn early_return_still_ends() {
        fn work(db: &SqliteDatabase) -> CoreResult<()> {
            let mut guard = TransactionGuard::begin(db)?;
            db.execute("INSERT INTO t VALUES (1)", &[])?;
            db.execute("INSERT INTO missing VALUES (1)", &[])?;
            guard.mark_successful()?;
            guard.end()
        }

        let db = db();
        assert!(work(&db).is_err());
        assert!(!db.in_transaction());
        assert_eq!(count(&db), 0);
    }
}
