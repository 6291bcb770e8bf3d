//! Data-driven adapter, the shape an offline schema compiler emits.

use super::hooks::check_arity;
use super::{
    AdapterKind, DefaultModelLoader, DefaultModelSaver, ModelAdapter, ModelLoader, ModelSaver,
    StatementCache, StatementKind,
};
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::any::{type_name, TypeId};
use std::sync::Arc;
use tabula_storage::{Row, SqlValue};

/// One stored column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// SQL type and constraints, e.g. `TEXT NOT NULL`.
    pub declaration: String,
}

/// A table, view or query-model adapter described by plain data.
///
/// # Example
///
/// ```rust,ignore
/// let users = SchemaAdapter::table::<User>("users")
///     .column("id", "INTEGER")
///     .column("name", "TEXT NOT NULL")
///     .primary_key("id");
/// ```
pub struct SchemaAdapter {
    entity_type: TypeId,
    entity_name: &'static str,
    name: String,
    kind: AdapterKind,
    columns: Vec<Column>,
    primary_key: Option<String>,
    /// SELECT behind a view or query model.
    source: Option<String>,
    statements: StatementCache,
    loader: RwLock<Arc<dyn ModelLoader>>,
    saver: RwLock<Arc<dyn ModelSaver>>,
}

impl SchemaAdapter {
    fn new<T: 'static>(name: String, kind: AdapterKind, source: Option<String>) -> Self {
        Self {
            entity_type: TypeId::of::<T>(),
            entity_name: type_name::<T>(),
            name,
            kind,
            columns: Vec::new(),
            primary_key: None,
            source,
            statements: StatementCache::new(),
            loader: RwLock::new(Arc::new(DefaultModelLoader)),
            saver: RwLock::new(Arc::new(DefaultModelSaver)),
        }
    }

    /// Describes a stored table for entity type `T`.
    #[must_use]
    pub fn table<T: 'static>(name: impl Into<String>) -> Self {
        Self::new::<T>(name.into(), AdapterKind::Table, None)
    }

    /// Describes a view for entity type `T`.
    #[must_use]
    pub fn view<T: 'static>(name: impl Into<String>, select: impl Into<String>) -> Self {
        Self::new::<T>(name.into(), AdapterKind::View, Some(select.into()))
    }

    /// Describes a query-model projection for entity type `T`.
    #[must_use]
    pub fn query_model<T: 'static>(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self::new::<T>(name.into(), AdapterKind::QueryModel, Some(query.into()))
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, declaration: impl Into<String>) -> Self {
        self.columns.push(Column {
            name: name.into(),
            declaration: declaration.into(),
        });
        self
    }

    /// Names the primary-key column. Defaults to the first column.
    #[must_use]
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    /// Returns the declared columns.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns the prepared-statement cache.
    #[must_use]
    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Returns the installed loader.
    #[must_use]
    pub fn loader(&self) -> Arc<dyn ModelLoader> {
        Arc::clone(&*self.loader.read())
    }

    /// Returns the installed saver.
    #[must_use]
    pub fn saver(&self) -> Arc<dyn ModelSaver> {
        Arc::clone(&*self.saver.read())
    }

    fn key_column(&self) -> CoreResult<&str> {
        self.primary_key
            .as_deref()
            .or_else(|| self.columns.first().map(|c| c.name.as_str()))
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("{} has no key column", self.name))
            })
    }

    /// Returns the primary-key value out of a full row of column values.
    pub fn key_of<'a>(&self, values: &'a [SqlValue]) -> CoreResult<&'a SqlValue> {
        let key = self.key_column()?;
        self.columns
            .iter()
            .position(|c| c.name == key)
            .and_then(|i| values.get(i))
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("{}: no value for key {key}", self.name))
            })
    }

    fn writable(&self) -> CoreResult<()> {
        if self.kind != AdapterKind::Table {
            return Err(CoreError::invalid_operation(format!(
                "{} is a {:?} and cannot be written",
                self.name, self.kind
            )));
        }
        if self.columns.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "{} declares no columns",
                self.name
            )));
        }
        Ok(())
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn placeholders(&self) -> String {
        (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn insert_sql(&self) -> CoreResult<String> {
        self.writable()?;
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&self.name),
            self.column_list(),
            self.placeholders()
        ))
    }

    pub(crate) fn save_sql(&self) -> CoreResult<String> {
        self.writable()?;
        Ok(format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(&self.name),
            self.column_list(),
            self.placeholders()
        ))
    }

    pub(crate) fn update_sql(&self) -> CoreResult<String> {
        self.writable()?;
        let assignments = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote(&c.name), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "UPDATE {} SET {assignments} WHERE {} = ?{}",
            quote(&self.name),
            quote(self.key_column()?),
            self.columns.len() + 1
        ))
    }

    pub(crate) fn delete_sql(&self) -> CoreResult<String> {
        self.writable()?;
        Ok(format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote(&self.name),
            quote(self.key_column()?)
        ))
    }

    pub(crate) fn select_sql(&self) -> String {
        match (&self.kind, &self.source) {
            (AdapterKind::QueryModel, Some(query)) => query.clone(),
            _ => format!("SELECT * FROM {}", quote(&self.name)),
        }
    }

    /// Inserts a row through the installed saver.
    pub fn insert(&self, database: &Database, values: &[SqlValue]) -> CoreResult<i64> {
        check_arity(self, values)?;
        let db = database.writable_database()?;
        self.saver()
            .insert(self, db.as_ref(), &database.change_notifier(), values)
    }

    /// Inserts or replaces a row through the installed saver.
    pub fn save(&self, database: &Database, values: &[SqlValue]) -> CoreResult<i64> {
        check_arity(self, values)?;
        let db = database.writable_database()?;
        self.saver()
            .save(self, db.as_ref(), &database.change_notifier(), values)
    }

    /// Updates a row by primary key through the installed saver.
    pub fn update(&self, database: &Database, values: &[SqlValue]) -> CoreResult<bool> {
        check_arity(self, values)?;
        let db = database.writable_database()?;
        self.saver()
            .update(self, db.as_ref(), &database.change_notifier(), values)
    }

    /// Deletes a row by primary key through the installed saver.
    pub fn delete(&self, database: &Database, key: &SqlValue) -> CoreResult<bool> {
        let db = database.writable_database()?;
        self.saver()
            .delete(self, db.as_ref(), &database.change_notifier(), key)
    }

    /// Loads every row through the installed loader.
    pub fn load_all(&self, database: &Database) -> CoreResult<Vec<Row>> {
        let db = database.writable_database()?;
        self.loader().load(self, db.as_ref(), None, &[])
    }

    /// Loads rows matching a `WHERE` clause through the installed loader.
    pub fn load_where(
        &self,
        database: &Database,
        clause: &str,
        args: &[SqlValue],
    ) -> CoreResult<Vec<Row>> {
        let db = database.writable_database()?;
        self.loader().load(self, db.as_ref(), Some(clause), args)
    }
}

impl ModelAdapter for SchemaAdapter {
    fn entity_type(&self) -> TypeId {
        self.entity_type
    }

    fn entity_name(&self) -> &str {
        self.entity_name
    }

    fn table_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn creation_query(&self) -> Option<String> {
        match self.kind {
            AdapterKind::Table => {
                let mut defs: Vec<String> = self
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", quote(&c.name), c.declaration))
                    .collect();
                if let Some(key) = &self.primary_key {
                    defs.push(format!("PRIMARY KEY ({})", quote(key)));
                }
                Some(format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote(&self.name),
                    defs.join(", ")
                ))
            }
            AdapterKind::View => self.source.as_ref().map(|select| {
                format!("CREATE VIEW IF NOT EXISTS {} AS {select}", quote(&self.name))
            }),
            AdapterKind::QueryModel => None,
        }
    }

    fn close_statement(&self, kind: StatementKind) -> CoreResult<()> {
        self.statements.release(kind);
        Ok(())
    }

    fn set_loader(&self, loader: Arc<dyn ModelLoader>) {
        *self.loader.write() = loader;
    }

    fn set_saver(&self, saver: Arc<dyn ModelSaver>) {
        *self.saver.write() = saver;
    }
}

impl std::fmt::Debug for SchemaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaAdapter")
            .field("entity", &self.entity_name)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("columns", &self.columns)
            .field("statements", &self.statements)
            .finish_non_exhaustive()
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
