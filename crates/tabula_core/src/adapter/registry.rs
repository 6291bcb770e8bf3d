//! Lookup tables from entity type and storage name to adapter.

use super::{AdapterKind, ModelAdapter};
use crate::error::{CoreError, CoreResult};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps entity types and table names to their adapters.
///
/// Built once from the schema description and read-only afterwards. Every
/// adapter is keyed by its entity type; table adapters are also keyed by
/// storage-level name.
#[derive(Default)]
pub struct AdapterRegistry {
    by_type: HashMap<TypeId, Arc<dyn ModelAdapter>>,
    by_name: HashMap<String, Arc<dyn ModelAdapter>>,
    /// Registration order, for deterministic schema passes.
    order: Vec<Arc<dyn ModelAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter.
    ///
    /// # Errors
    ///
    /// A second adapter for the same entity type, or a second table with the
    /// same storage name, is a broken schema description and fails with
    /// [`CoreError::DuplicateEntityType`] / [`CoreError::DuplicateEntityName`].
    pub fn register(&mut self, adapter: Arc<dyn ModelAdapter>) -> CoreResult<()> {
        let entity_type = adapter.entity_type();
        if self.by_type.contains_key(&entity_type) {
            return Err(CoreError::DuplicateEntityType {
                entity: adapter.entity_name().to_string(),
            });
        }

        if adapter.kind() == AdapterKind::Table {
            let name = adapter.table_name().to_string();
            if self.by_name.contains_key(&name) {
                return Err(CoreError::DuplicateEntityName { name });
            }
            self.by_name.insert(name, Arc::clone(&adapter));
        }

        self.by_type.insert(entity_type, Arc::clone(&adapter));
        self.order.push(adapter);
        Ok(())
    }

    /// Looks up the adapter for entity type `T`.
    #[must_use]
    pub fn lookup<T: 'static>(&self) -> Option<&Arc<dyn ModelAdapter>> {
        self.lookup_by_type(TypeId::of::<T>())
    }

    /// Looks up an adapter by entity type.
    #[must_use]
    pub fn lookup_by_type(&self, entity_type: TypeId) -> Option<&Arc<dyn ModelAdapter>> {
        self.by_type.get(&entity_type)
    }

    /// Looks up a table adapter by storage-level name.
    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Option<&Arc<dyn ModelAdapter>> {
        self.by_name.get(name)
    }

    /// Returns a snapshot of every adapter.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn ModelAdapter>> {
        self.order.clone()
    }

    /// Iterates adapters of one kind, in registration order.
    pub fn of_kind(&self, kind: AdapterKind) -> impl Iterator<Item = &Arc<dyn ModelAdapter>> {
        self.order.iter().filter(move |a| a.kind() == kind)
    }

    /// Returns the number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.order.iter()).finish()
    }
}
