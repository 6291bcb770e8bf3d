//! # Tabula Core
//!
//! Lifecycle coordinator for an embedded relational database.
//!
//! This crate provides:
//! - Entity adapters and the registry that resolves them by type or name
//! - Versioned schema migrations
//! - Configuration overrides applied on construction, reset and reopen
//! - A lazily created storage handle restored from backup on creation
//! - Synchronous and queued asynchronous transactions
//! - Close, destroy, reset, reopen and backup
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabula_core::{Database, DatabaseDefinition, DatabaseSettings, SchemaAdapter, SqlValue};
//!
//! struct Note;
//!
//! let notes = Arc::new(
//!     SchemaAdapter::table::<Note>("notes")
//!         .column("id", "INTEGER")
//!         .column("body", "TEXT")
//!         .primary_key("id"),
//! );
//! let db = Database::open(
//!     DatabaseDefinition::new(DatabaseSettings::new("app").directory("data"))
//!         .adapter(notes.clone()),
//! )?;
//!
//! notes.insert(&db, &[SqlValue::Integer(1), "hello".into()])?;
//! db.close()?;
//! # Ok::<(), tabula_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
mod config;
mod database;
mod error;
pub mod handle;
mod helper;
mod lifecycle;
pub mod migration;
pub mod notify;
pub mod transaction;

pub use adapter::{
    AdapterKind, AdapterRegistry, ModelAdapter, ModelLoader, ModelSaver, SchemaAdapter,
    StatementKind,
};
pub use config::{DatabaseConfig, DatabaseSettings, TableConfig};
pub use database::{Database, DatabaseDefinition};
pub use error::{CoreError, CoreResult};
pub use handle::{DatabaseCallback, HandleFactory, HandleLease, OpenHelper};
pub use helper::{SchemaHelper, SchemaOutcome};
pub use lifecycle::LifecycleState;
pub use migration::{Migration, MigrationRegistry, SchemaVersion};
pub use notify::{ChangeAction, DirectModelNotifier, ModelNotifier};
pub use transaction::{AsyncTransaction, TransactionBuilder, TransactionHandle};

pub use tabula_storage::{DatabaseWrapper, Row, SqlValue};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
