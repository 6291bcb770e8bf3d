//! Loader and saver hooks.
//!
//! Every [`SchemaAdapter`] reads through a [`ModelLoader`] and writes through
//! a [`ModelSaver`]. Both traits come with working default methods, so an
//! override only implements what it changes.

use super::{ModelAdapter, SchemaAdapter, StatementKind};
use crate::error::{CoreError, CoreResult};
use crate::notify::{ChangeAction, ModelNotifier};
use tabula_storage::{DatabaseWrapper, Row, SqlValue};

/// Writes rows for one adapter.
pub trait ModelSaver: Send + Sync {
    /// Inserts a row, returning its row id.
    fn insert(
        &self,
        adapter: &SchemaAdapter,
        db: &dyn DatabaseWrapper,
        notifier: &dyn ModelNotifier,
        values: &[SqlValue],
    ) -> CoreResult<i64> {
        let id = adapter.statements().with_statement(
            StatementKind::Insert,
            db,
            || adapter.insert_sql(),
            |stmt| {
                bind_all(stmt, values)?;
                Ok(stmt.execute_insert()?)
            },
        )?;
        notifier.notify_table_changed(adapter.table_name(), ChangeAction::Insert);
        Ok(id)
    }

    /// Inserts or replaces a row, returning its row id.
    fn save(
        &self,
        adapter: &SchemaAdapter,
        db: &dyn DatabaseWrapper,
        notifier: &dyn ModelNotifier,
        values: &[SqlValue],
    ) -> CoreResult<i64> {
        let id = adapter.statements().with_statement(
            StatementKind::Compiled,
            db,
            || adapter.save_sql(),
            |stmt| {
                bind_all(stmt, values)?;
                Ok(stmt.execute_insert()?)
            },
        )?;
        notifier.notify_table_changed(adapter.table_name(), ChangeAction::Save);
        Ok(id)
    }

    /// Updates the row whose primary key matches, returning whether it existed.
    ///
    /// `values` lists every column in declaration order, key included.
    fn update(
        &self,
        adapter: &SchemaAdapter,
        db: &dyn DatabaseWrapper,
        notifier: &dyn ModelNotifier,
        values: &[SqlValue],
    ) -> CoreResult<bool> {
        let key = adapter.key_of(values)?.clone();
        let changed = adapter.statements().with_statement(
            StatementKind::Update,
            db,
            || adapter.update_sql(),
            |stmt| {
                bind_all(stmt, values)?;
                stmt.bind(values.len() + 1, key)?;
                Ok(stmt.execute_update_delete()?)
            },
        )?;
        if changed > 0 {
            notifier.notify_table_changed(adapter.table_name(), ChangeAction::Update);
        }
        Ok(changed > 0)
    }

    /// Deletes the row with primary key `key`, returning whether it existed.
    fn delete(
        &self,
        adapter: &SchemaAdapter,
        db: &dyn DatabaseWrapper,
        notifier: &dyn ModelNotifier,
        key: &SqlValue,
    ) -> CoreResult<bool> {
        let changed = adapter.statements().with_statement(
            StatementKind::Delete,
            db,
            || adapter.delete_sql(),
            |stmt| {
                stmt.bind(1, key.clone())?;
                Ok(stmt.execute_update_delete()?)
            },
        )?;
        if changed > 0 {
            notifier.notify_table_changed(adapter.table_name(), ChangeAction::Delete);
        }
        Ok(changed > 0)
    }
}

/// Reads rows for one adapter.
pub trait ModelLoader: Send + Sync {
    /// Loads rows, optionally filtered by a `WHERE` clause.
    fn load(
        &self,
        adapter: &SchemaAdapter,
        db: &dyn DatabaseWrapper,
        filter: Option<&str>,
        args: &[SqlValue],
    ) -> CoreResult<Vec<Row>> {
        let base = adapter.select_sql();
        let sql = match filter {
            Some(clause) => format!("SELECT * FROM ({base}) WHERE {clause}"),
            None => base,
        };
        Ok(db.query(&sql, args)?)
    }
}

/// The stock saver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultModelSaver;

impl ModelSaver for DefaultModelSaver {}

/// The stock loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultModelLoader;

impl ModelLoader for DefaultModelLoader {}

fn bind_all(
    stmt: &mut dyn tabula_storage::DatabaseStatement,
    values: &[SqlValue],
) -> CoreResult<()> {
    for (i, value) in values.iter().enumerate() {
        stmt.bind(i + 1, value.clone())?;
    }
    Ok(())
}

pub(crate) fn check_arity(adapter: &SchemaAdapter, values: &[SqlValue]) -> CoreResult<()> {
    let expected = adapter.columns().len();
    if values.len() == expected {
        Ok(())
    } else {
        Err(CoreError::invalid_operation(format!(
            "{} expects {expected} values, got {}",
            adapter.table_name(),
            values.len()
        )))
    }
}
