//! Engine-facing traits.

use crate::error::StorageResult;
use crate::value::{Row, SqlValue};

/// A live session with a relational engine.
///
/// `DatabaseWrapper` is the only surface through which the coordinator and
/// the entity adapters touch the physical engine. Implementations own the
/// connection and must serialize access internally.
///
/// # Transactions
///
/// Transactions nest. Each `begin_transaction` must be paired with exactly
/// one `end_transaction`. Only the outermost `end_transaction` talks to the
/// engine: it commits when every nesting level called
/// `set_transaction_successful`, and rolls back otherwise.
pub trait DatabaseWrapper: Send + Sync {
    /// Executes a statement that returns no rows.
    ///
    /// Returns the number of rows changed.
    fn execute(&self, sql: &str, args: &[SqlValue]) -> StorageResult<usize>;

    /// Executes a query and collects every row.
    fn query(&self, sql: &str, args: &[SqlValue]) -> StorageResult<Vec<Row>>;

    /// Compiles a reusable statement.
    fn compile_statement(&self, sql: &str) -> StorageResult<Box<dyn DatabaseStatement>>;

    /// Begins a (possibly nested) transaction.
    fn begin_transaction(&self) -> StorageResult<()>;

    /// Marks the innermost open transaction as successful.
    fn set_transaction_successful(&self) -> StorageResult<()>;

    /// Ends the innermost open transaction.
    fn end_transaction(&self) -> StorageResult<()>;

    /// Returns true while a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Returns the schema version stored in the database.
    fn version(&self) -> StorageResult<i64>;

    /// Stores the schema version.
    fn set_version(&self, version: i64) -> StorageResult<()>;

    /// Runs the engine's quick consistency check.
    fn integrity_ok(&self) -> StorageResult<bool>;
}

/// A compiled statement with positional bindings.
///
/// Binding indexes are 1-based, as in SQL.
pub trait DatabaseStatement: Send + Sync {
    /// Returns the SQL text of the statement.
    fn sql(&self) -> &str;

    /// Binds a value at a 1-based position.
    fn bind(&mut self, index: usize, value: SqlValue) -> StorageResult<()>;

    /// Clears every binding.
    fn clear_bindings(&mut self);

    /// Executes an insert, returning the new row id.
    fn execute_insert(&mut self) -> StorageResult<i64>;

    /// Executes an update or delete, returning the number of changed rows.
    fn execute_update_delete(&mut self) -> StorageResult<usize>;

    /// Runs a query whose first column of the first row is an integer.
    fn simple_query_for_long(&mut self) -> StorageResult<Option<i64>>;

    /// Releases the statement. Further use fails.
    fn close(&mut self);

    /// Returns true once `close` has been called.
    fn is_closed(&self) -> bool;
}
