//! Schema creation and upgrade.
//!
//! When a handle opens its database, [`SchemaHelper::on_open`] compares the
//! stored schema version with the target version and creates or upgrades the
//! schema:
//!
//! - Version 0 (fresh database): create tables, run every migration up to the
//!   target, create views
//! - Older version: create new tables, run the buckets in `(old, target]` in
//!   ascending order, refresh views
//! - Newer version: refused, schemas only move forward

use crate::adapter::{AdapterKind, AdapterRegistry};
use crate::error::{CoreError, CoreResult};
use crate::handle::DatabaseCallback;
use crate::migration::{MigrationRegistry, SchemaVersion};
use crate::transaction::TransactionGuard;
use std::sync::Arc;
use tabula_storage::DatabaseWrapper;
use tracing::{debug, info};

/// What [`SchemaHelper::on_open`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// The stored version already matched.
    Unchanged,
    /// The schema was created from scratch.
    Created,
    /// The schema was upgraded.
    Upgraded {
        /// Version found in the database.
        from: SchemaVersion,
        /// Version written.
        to: SchemaVersion,
    },
}

/// Applies the schema description to an open database.
pub struct SchemaHelper {
    adapters: Arc<AdapterRegistry>,
    migrations: Arc<MigrationRegistry>,
    version: SchemaVersion,
    listener: Option<Arc<dyn DatabaseCallback>>,
}

impl SchemaHelper {
    /// Creates a helper targeting `version`.
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        migrations: Arc<MigrationRegistry>,
        version: SchemaVersion,
        listener: Option<Arc<dyn DatabaseCallback>>,
    ) -> Self {
        Self {
            adapters,
            migrations,
            version,
            listener,
        }
    }

    /// Returns the target version.
    #[must_use]
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Brings the schema of `db` to the target version.
    pub fn on_open(&self, db: &dyn DatabaseWrapper) -> CoreResult<SchemaOutcome> {
        let current = db.version()?;
        if current == 0 {
            self.on_create(db)?;
            return Ok(SchemaOutcome::Created);
        }
        if current > self.version {
            return Err(CoreError::migration_failed(format!(
                "database is at version {current}, newer than target {}",
                self.version
            )));
        }
        if current < self.version {
            self.on_upgrade(db, current, self.version)?;
            return Ok(SchemaOutcome::Upgraded {
                from: current,
                to: self.version,
            });
        }
        Ok(SchemaOutcome::Unchanged)
    }

    /// Creates the schema in an empty database.
    pub fn on_create(&self, db: &dyn DatabaseWrapper) -> CoreResult<()> {
        let mut guard = TransactionGuard::begin(db)?;
        self.create_entities(db, AdapterKind::Table)?;
        self.run_migrations(db, SchemaVersion::MIN, self.version)?;
        self.create_entities(db, AdapterKind::View)?;
        db.set_version(self.version)?;
        guard.mark_successful()?;
        guard.end()?;

        info!(version = self.version, "created schema");
        if let Some(listener) = &self.listener {
            listener.on_create(db);
        }
        Ok(())
    }

    /// Upgrades the schema from `old` to `new`.
    pub fn on_upgrade(
        &self,
        db: &dyn DatabaseWrapper,
        old: SchemaVersion,
        new: SchemaVersion,
    ) -> CoreResult<()> {
        let mut guard = TransactionGuard::begin(db)?;
        self.create_entities(db, AdapterKind::Table)?;
        self.run_migrations(db, old, new)?;
        self.create_entities(db, AdapterKind::View)?;
        db.set_version(new)?;
        guard.mark_successful()?;
        guard.end()?;

        info!(from = old, to = new, "upgraded schema");
        if let Some(listener) = &self.listener {
            listener.on_upgrade(db, old, new);
        }
        Ok(())
    }

    fn create_entities(&self, db: &dyn DatabaseWrapper, kind: AdapterKind) -> CoreResult<()> {
        for adapter in self.adapters.of_kind(kind) {
            if let Some(sql) = adapter.creation_query() {
                db.execute(&sql, &[])?;
            }
        }
        Ok(())
    }

    fn run_migrations(
        &self,
        db: &dyn DatabaseWrapper,
        after: SchemaVersion,
        up_to: SchemaVersion,
    ) -> CoreResult<()> {
        for (version, steps) in self.migrations.pending(after, up_to) {
            for step in steps {
                debug!(version, migration = step.name(), "running migration");
                let mut guard = TransactionGuard::begin(db)?;
                step.on_pre_migrate();
                step.migrate(db).map_err(|e| {
                    CoreError::migration_failed(format!(
                        "{} (version {version}): {e}",
                        step.name()
                    ))
                })?;
                guard.mark_successful()?;
                guard.end()?;
                step.on_post_migrate();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SchemaHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaHelper")
            .field("version", &self.version)
            .field("adapters", &self.adapters.len())
            .field("migrations", &self.migrations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SchemaAdapter;
    use crate::migration::{AlterTableMigration, Migration, SqlMigration};
    use parking_lot::Mutex;
    use tabula_storage::{SqlValue, SqliteDatabase};

    struct User;
    struct UserCount;

    fn adapters() -> Arc<AdapterRegistry> {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(
                SchemaAdapter::table::<User>("users")
                    .column("id", "INTEGER")
                    .column("name", "TEXT")
                    .primary_key("id"),
            ))
            .unwrap();
        registry
            .register(Arc::new(SchemaAdapter::view::<UserCount>(
                "user_count",
                "SELECT COUNT(*) AS n FROM users",
            )))
            .unwrap();
        Arc::new(registry)
    }

    fn tables(db: &SqliteDatabase) -> Vec<String> {
        db.query(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name",
            &[],
        )
        .unwrap()
        .into_iter()
        .filter_map(|row| row[0].as_str().map(String::from))
        .collect()
    }

    #[test]
    fn fresh_database_is_created() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let helper = SchemaHelper::new(adapters(), Arc::new(MigrationRegistry::new()), 1, None);

        assert_eq!(helper.on_open(&db).unwrap(), SchemaOutcome::Created);
        assert_eq!(db.version().unwrap(), 1);
        assert_eq!(tables(&db), vec!["user_count", "users"]);
        assert_eq!(helper.on_open(&db).unwrap(), SchemaOutcome::Unchanged);
    }

    #[test]
    fn upgrade_runs_only_newer_buckets_in_order() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        SchemaHelper::new(adapters(), Arc::new(MigrationRegistry::new()), 1, None)
            .on_open(&db)
            .unwrap();

        let mut migrations = MigrationRegistry::new();
        migrations.register(
            1,
            Arc::new(SqlMigration::new("never", "INSERT INTO missing VALUES (1)")),
        );
        migrations.register(2, Arc::new(AlterTableMigration::new("users").add_column("email", "TEXT")));
        migrations.register(
            2,
            Arc::new(SqlMigration::new(
                "seed",
                "INSERT INTO users (id, name, email) VALUES (1, 'ann', 'a@x')",
            )),
        );

        let helper = SchemaHelper::new(adapters(), Arc::new(migrations), 2, None);
        assert_eq!(
            helper.on_open(&db).unwrap(),
            SchemaOutcome::Upgraded { from: 1, to: 2 }
        );
        let rows = db.query("SELECT email FROM users", &[]).unwrap();
        assert_eq!(rows, vec![vec![SqlValue::from("a@x")]]);
    }

    #[test]
    fn failed_migration_rolls_back_upgrade() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        SchemaHelper::new(adapters(), Arc::new(MigrationRegistry::new()), 1, None)
            .on_open(&db)
            .unwrap();

        let mut migrations = MigrationRegistry::new();
        migrations.register(2, Arc::new(SqlMigration::new("ok", "INSERT INTO users VALUES (5, 'e')")));
        migrations.register(2, Arc::new(SqlMigration::new("bad", "DROP TABLE nope")));

        let err = SchemaHelper::new(adapters(), Arc::new(migrations), 2, None)
            .on_open(&db)
            .unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { ref message } if message.contains("bad")));
        assert_eq!(db.version().unwrap(), 1);
        assert!(db.query("SELECT * FROM users", &[]).unwrap().is_empty());
        assert!(!db.in_transaction());
    }

    #[test]
    fn downgrade_is_refused() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.set_version(5).unwrap();
        let helper = SchemaHelper::new(adapters(), Arc::new(MigrationRegistry::new()), 3, None);
        assert!(matches!(
            helper.on_open(&db),
            Err(CoreError::MigrationFailed { .. })
        ));
    }

    #[test]
    fn step_hooks_and_listener_fire() {
        #[derive(Default)]
        struct Log(Mutex<Vec<String>>);

        impl DatabaseCallback for Log {
            fn on_create(&self, _db: &dyn DatabaseWrapper) {
                self.0.lock().push("create".into());
            }
        }

        struct Traced(Arc<Log>);

        impl Migration for Traced {
            fn name(&self) -> &str {
                "traced"
            }
            fn on_pre_migrate(&self) {
                self.0 .0.lock().push("pre".into());
            }
            fn migrate(&self, _db: &dyn DatabaseWrapper) -> CoreResult<()> {
                self.0 .0.lock().push("migrate".into());
                Ok(())
            }
            fn on_post_migrate(&self) {
                self.0 .0.lock().push("post".into());
            }
        }

        let log = Arc::new(Log::default());
        let mut migrations = MigrationRegistry::new();
        migrations.register(1, Arc::new(Traced(Arc::clone(&log))));

        let db = SqliteDatabase::open_in_memory().unwrap();
        let listener: Arc<dyn DatabaseCallback> = log.clone();
        SchemaHelper::new(adapters(), Arc::new(migrations), 1, Some(listener))
            .on_open(&db)
            .unwrap();

        assert_eq!(*log.0.lock(), vec!["pre", "migrate", "post", "create"]);
    }
}
