//! Schema migrations.
//!
//! Migrations are bucketed by the schema version they upgrade to. Within a
//! bucket, steps run in the order they were registered, so callers register
//! them in the intended execution order.
//!
//! ## Design Philosophy
//!
//! - **Forward-only**: downgrades are refused, restore from a backup instead
//! - **Plan, not driver**: the registry stores steps; the schema helper runs them
//! - **Transactional**: each step runs in its own transaction
//!
//! ## Usage
//!
//! ```ignore
//! use tabula_core::migration::{MigrationRegistry, SqlMigration};
//!
//! let mut migrations = MigrationRegistry::new();
//! migrations.register(2, Arc::new(SqlMigration::new("add_email", "ALTER TABLE users ADD COLUMN email TEXT")));
//! migrations.register(2, Arc::new(SqlMigration::new("index_email", "CREATE INDEX users_email ON users(email)")));
//! ```

use crate::error::CoreResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tabula_storage::DatabaseWrapper;

/// Schema version number.
pub type SchemaVersion = i64;

/// One executable schema transformation.
pub trait Migration: Send + Sync {
    /// Returns the name of this step.
    fn name(&self) -> &str;

    /// Runs before [`migrate`](Self::migrate), inside the step's transaction.
    fn on_pre_migrate(&self) {}

    /// Applies the step.
    fn migrate(&self, db: &dyn DatabaseWrapper) -> CoreResult<()>;

    /// Runs after [`migrate`](Self::migrate) succeeded.
    fn on_post_migrate(&self) {}
}

impl std::fmt::Debug for dyn Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Migration").field(&self.name()).finish()
    }
}

/// Information about a registered step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Target version.
    pub version: SchemaVersion,
    /// Position within the version bucket.
    pub position: usize,
    /// Step name.
    pub name: String,
}

/// Migration plan: ordered steps per target version.
#[derive(Default, Clone)]
pub struct MigrationRegistry {
    buckets: BTreeMap<SchemaVersion, Vec<Arc<dyn Migration>>>,
}

impl MigrationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step to the bucket for `version`.
    pub fn register(&mut self, version: SchemaVersion, step: Arc<dyn Migration>) {
        self.buckets.entry(version).or_default().push(step);
    }

    /// Returns an immutable snapshot of the plan.
    #[must_use]
    pub fn migrations_by_version(&self) -> BTreeMap<SchemaVersion, Vec<Arc<dyn Migration>>> {
        self.buckets.clone()
    }

    /// Returns the steps for one version, in execution order.
    #[must_use]
    pub fn steps(&self, version: SchemaVersion) -> &[Arc<dyn Migration>] {
        self.buckets.get(&version).map_or(&[], Vec::as_slice)
    }

    /// Iterates buckets with `after < version <= up_to`, ascending.
    pub fn pending(
        &self,
        after: SchemaVersion,
        up_to: SchemaVersion,
    ) -> impl Iterator<Item = (SchemaVersion, &[Arc<dyn Migration>])> {
        let range = (after < up_to).then(|| self.buckets.range(after + 1..=up_to));
        range
            .into_iter()
            .flatten()
            .map(|(v, steps)| (*v, steps.as_slice()))
    }

    /// Lists every step.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.buckets
            .iter()
            .flat_map(|(version, steps)| {
                steps.iter().enumerate().map(|(position, step)| MigrationInfo {
                    version: *version,
                    position,
                    name: step.name().to_string(),
                })
            })
            .collect()
    }

    /// Returns the highest version with registered steps.
    #[must_use]
    pub fn latest_version(&self) -> Option<SchemaVersion> {
        self.buckets.keys().next_back().copied()
    }

    /// Returns true if no step is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.buckets.iter()).finish()
    }
}

/// A step that runs a fixed SQL script.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    name: String,
    statements: Vec<String>,
}

impl SqlMigration {
    /// Creates a step running one statement.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statements: vec![sql.into()],
        }
    }

    /// Adds another statement.
    #[must_use]
    pub fn then(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }
}

impl Migration for SqlMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn migrate(&self, db: &dyn DatabaseWrapper) -> CoreResult<()> {
        for sql in &self.statements {
            db.execute(sql, &[])?;
        }
        Ok(())
    }
}

/// A step that adds columns to an existing table.
#[derive(Debug, Clone)]
pub struct AlterTableMigration {
    table: String,
    name: String,
    columns: Vec<(String, String)>,
}

impl AlterTableMigration {
    /// Creates a step altering `table`.
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            name: format!("alter_{table}"),
            table,
            columns: Vec::new(),
        }
    }

    /// Adds a column with a SQL type declaration.
    #[must_use]
    pub fn add_column(mut self, name: impl Into<String>, declaration: impl Into<String>) -> Self {
        self.columns.push((name.into(), declaration.into()));
        self
    }
}

impl Migration for AlterTableMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn migrate(&self, db: &dyn DatabaseWrapper) -> CoreResult<()> {
        for (column, declaration) in &self.columns {
            db.execute(
                &format!(
                    "ALTER TABLE \"{}\" ADD COLUMN \"{column}\" {declaration}",
                    self.table
                ),
                &[],
            )?;
        }
        Ok(())
    }
}
