//! Entity adapters and their registry.
//!
//! An adapter mediates between one application-level type and its stored
//! representation. Adapters are produced ahead of time from the schema
//! description and handed to the coordinator as opaque [`ModelAdapter`]
//! objects.

mod hooks;
mod registry;
mod schema;
mod statements;

pub use hooks::{DefaultModelLoader, DefaultModelSaver, ModelLoader, ModelSaver};
pub use registry::AdapterRegistry;
pub use schema::{Column, SchemaAdapter};
pub use statements::StatementCache;

use crate::error::CoreResult;
use std::any::TypeId;
use std::sync::Arc;

/// What kind of schema entity an adapter represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// A stored table.
    Table,
    /// A view over one or more tables.
    View,
    /// A projection of an arbitrary query. Never created in the schema.
    QueryModel,
}

/// The prepared statements an adapter creates lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Plain insert.
    Insert,
    /// Insert-or-replace used by save.
    Compiled,
    /// Delete by primary key.
    Delete,
    /// Update by primary key.
    Update,
}

impl StatementKind {
    /// Every statement kind, in release order.
    pub const ALL: [StatementKind; 4] = [
        StatementKind::Insert,
        StatementKind::Compiled,
        StatementKind::Delete,
        StatementKind::Update,
    ];

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Insert => 0,
            Self::Compiled => 1,
            Self::Delete => 2,
            Self::Update => 3,
        }
    }
}

/// One schema entity as seen by the coordinator.
///
/// Implementations must be thread-safe: hooks are swapped by the
/// configuration applier while other threads may use the adapter.
pub trait ModelAdapter: Send + Sync {
    /// Identifier of the application-level type.
    fn entity_type(&self) -> TypeId;

    /// Human-readable name of the application-level type.
    fn entity_name(&self) -> &str;

    /// Storage-level name (table, view, or query-model name).
    fn table_name(&self) -> &str;

    /// The kind of entity.
    fn kind(&self) -> AdapterKind;

    /// SQL creating the entity, if it lives in the schema.
    fn creation_query(&self) -> Option<String>;

    /// Releases one category of prepared statement.
    ///
    /// Releasing a statement that was never prepared is a no-op.
    fn close_statement(&self, kind: StatementKind) -> CoreResult<()>;

    /// Replaces the loader hook.
    fn set_loader(&self, loader: Arc<dyn ModelLoader>);

    /// Replaces the saver hook.
    fn set_saver(&self, saver: Arc<dyn ModelSaver>);
}

impl std::fmt::Debug for dyn ModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("entity", &self.entity_name())
            .field("table", &self.table_name())
            .field("kind", &self.kind())
            .finish()
    }
}
