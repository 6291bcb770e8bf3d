//! # Tabula Storage
//!
//! The storage engine seam for Tabula.
//!
//! This crate is the lowest layer of the workspace. It defines how the
//! coordinator talks to a physical relational engine and ships the SQLite
//! implementation used by default.
//!
//! ## Design Principles
//!
//! - The engine is reached only through [`DatabaseWrapper`] and
//!   [`DatabaseStatement`]
//! - No knowledge of adapters, migrations, or lifecycle
//! - Implementations must be `Send + Sync` so one handle can serve many threads
//!
//! ## Example
//!
//! ```rust
//! use tabula_storage::{DatabaseWrapper, SqlValue, SqliteDatabase};
//!
//! let db = SqliteDatabase::open_in_memory().unwrap();
//! db.execute("CREATE TABLE t (v INTEGER)", &[]).unwrap();
//! db.execute("INSERT INTO t (v) VALUES (?1)", &[SqlValue::Integer(7)]).unwrap();
//! let rows = db.query("SELECT v FROM t", &[]).unwrap();
//! assert_eq!(rows[0][0], SqlValue::Integer(7));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod sqlite;
mod value;
mod wrapper;

pub use error::{StorageError, StorageResult};
pub use file::{copy_file, delete_database_files, storage_exists};
pub use sqlite::{SqliteDatabase, SqliteStatement};
pub use value::{Row, SqlValue};
pub use wrapper::{DatabaseStatement, DatabaseWrapper};
