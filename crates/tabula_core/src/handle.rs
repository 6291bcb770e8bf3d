//! Storage handles.
//!
//! A handle is an [`OpenHelper`]: it owns the live engine session of one
//! logical database and knows how to back it up and restore it. The
//! coordinator builds handles through a [`HandleFactory`] and hands callers
//! generation-stamped [`HandleLease`]s.

use crate::config::DatabaseSettings;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::helper::SchemaHelper;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tabula_storage::{
    copy_file, delete_database_files, storage_exists, DatabaseWrapper, SqliteDatabase,
};
use tracing::{debug, info, warn};

/// Lifecycle events of the physical database.
///
/// Every method has a no-op default. Callbacks receive the engine session
/// directly and must not call back into the coordinator's handle methods.
pub trait DatabaseCallback: Send + Sync {
    /// The database was opened and its schema is current.
    fn on_open(&self, _db: &dyn DatabaseWrapper) {}

    /// The schema was created from scratch.
    fn on_create(&self, _db: &dyn DatabaseWrapper) {}

    /// The schema was upgraded.
    fn on_upgrade(&self, _db: &dyn DatabaseWrapper, _old: i64, _new: i64) {}

    /// A backup was written to `_path`.
    fn on_backed_up(&self, _path: &Path) {}

    /// The database file at `_path` was restored from its backup.
    fn on_restored(&self, _path: &Path) {}

    /// The database file at `_path`, its side files and its backup were
    /// deleted by a destroy or reset.
    fn on_deleted(&self, _path: &Path) {}
}

/// A storage handle.
pub trait OpenHelper: Send + Sync {
    /// Returns the engine session, opening the database on first use.
    fn database(&self) -> CoreResult<Arc<dyn DatabaseWrapper>>;

    /// Closes the engine session.
    fn close_db(&self) -> CoreResult<()>;

    /// Writes a backup of the live database.
    fn backup_db(&self) -> CoreResult<()>;

    /// Restores the database file from its backup if the file is missing or
    /// damaged. Returns whether a restore happened.
    fn perform_restore_from_backup(&self) -> CoreResult<bool>;

    /// Runs the engine's consistency check.
    fn is_database_integrity_ok(&self) -> bool;
}

/// Builds storage handles.
pub trait HandleFactory: Send + Sync {
    /// Creates a handle for `database`.
    ///
    /// Called under the coordinator's initialization lock, at most once per
    /// handle generation.
    fn create_helper(
        &self,
        database: &Database,
        listener: Option<Arc<dyn DatabaseCallback>>,
    ) -> CoreResult<Arc<dyn OpenHelper>>;
}

/// A handle reference valid for one handle generation.
///
/// Once the coordinator closes, reopens, resets or destroys the database,
/// every lease taken earlier fails with [`CoreError::StaleHandle`] instead of
/// reaching the torn-down handle.
#[derive(Clone)]
pub struct HandleLease {
    helper: Arc<dyn OpenHelper>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl HandleLease {
    pub(crate) fn new(helper: Arc<dyn OpenHelper>, current: Arc<AtomicU64>) -> Self {
        Self {
            generation: current.load(Ordering::Acquire),
            helper,
            current,
        }
    }

    /// Returns the generation this lease was taken in.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true while the handle behind this lease is live.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    fn check(&self) -> CoreResult<()> {
        let current = self.current.load(Ordering::Acquire);
        if current == self.generation {
            Ok(())
        } else {
            Err(CoreError::StaleHandle {
                held: self.generation,
                current,
            })
        }
    }

    /// Returns the engine session.
    pub fn database(&self) -> CoreResult<Arc<dyn DatabaseWrapper>> {
        self.check()?;
        self.helper.database()
    }

    /// Returns the handle itself.
    pub fn open_helper(&self) -> CoreResult<&Arc<dyn OpenHelper>> {
        self.check()?;
        Ok(&self.helper)
    }
}

impl std::fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleLease")
            .field("generation", &self.generation)
            .field("current", &self.is_current())
            .finish()
    }
}

/// The default handle: one SQLite session per generation.
///
/// The database is opened lazily by the first [`database`](OpenHelper::database)
/// call. Opening copies in a prepackaged file if none exists, runs the
/// consistency check when enabled (restoring from backup on failure), applies
/// foreign-key enforcement and brings the schema up to date.
pub struct SqliteOpenHelper {
    settings: DatabaseSettings,
    schema: SchemaHelper,
    listener: Option<Arc<dyn DatabaseCallback>>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    db: Option<Arc<SqliteDatabase>>,
    /// Set by `close_db`; a closed handle never reopens.
    closed: bool,
}

impl SqliteOpenHelper {
    /// Creates an unopened handle.
    pub fn new(
        settings: DatabaseSettings,
        schema: SchemaHelper,
        listener: Option<Arc<dyn DatabaseCallback>>,
    ) -> Self {
        Self {
            settings,
            schema,
            listener,
            session: Mutex::new(Session::default()),
        }
    }

    /// Returns the settings this handle was built with.
    #[must_use]
    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    /// Returns true while the session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.lock().db.as_ref().is_some_and(|db| db.is_open())
    }

    fn session(&self) -> CoreResult<Arc<SqliteDatabase>> {
        let mut session = self.session.lock();
        if session.closed {
            return Err(CoreError::DatabaseClosed);
        }
        if let Some(db) = session.db.as_ref().filter(|db| db.is_open()) {
            return Ok(Arc::clone(db));
        }
        let db = Arc::new(self.open()?);
        session.db = Some(Arc::clone(&db));
        Ok(db)
    }

    fn open(&self) -> CoreResult<SqliteDatabase> {
        let db = if self.settings.in_memory {
            SqliteDatabase::open_in_memory()?
        } else {
            let path = self.settings.file_path();
            self.copy_prepackaged(&path)?;
            let db = SqliteDatabase::open(&path)?;
            if self.settings.consistency_checks && !db.integrity_ok().unwrap_or(false) {
                self.recover(db, &path)?
            } else {
                db
            }
        };

        if let Err(e) = self.prepare(&db) {
            let _ = db.close();
            return Err(e);
        }
        debug!(database = %self.settings.name, "opened database");
        Ok(db)
    }

    fn prepare(&self, db: &SqliteDatabase) -> CoreResult<()> {
        db.set_foreign_keys(self.settings.foreign_keys)?;
        self.schema.on_open(db)?;
        if let Some(listener) = &self.listener {
            listener.on_open(db);
        }
        Ok(())
    }

    fn copy_prepackaged(&self, path: &Path) -> CoreResult<()> {
        let Some(source) = &self.settings.prepackaged else {
            return Ok(());
        };
        if storage_exists(path) || !storage_exists(source) {
            return Ok(());
        }
        copy_file(source, path)?;
        info!(from = %source.display(), to = %path.display(), "copied prepackaged database");
        Ok(())
    }

    /// Replaces a damaged database with its backup.
    fn recover(&self, damaged: SqliteDatabase, path: &Path) -> CoreResult<SqliteDatabase> {
        warn!(path = %path.display(), "database failed consistency check");
        let _ = damaged.close();
        if !self.restore_backup(path)? {
            return Err(CoreError::IntegrityCheckFailed {
                path: path.to_path_buf(),
            });
        }
        let db = SqliteDatabase::open(path)?;
        if !db.integrity_ok().unwrap_or(false) {
            let _ = db.close();
            return Err(CoreError::IntegrityCheckFailed {
                path: path.to_path_buf(),
            });
        }
        Ok(db)
    }

    fn restore_backup(&self, path: &Path) -> CoreResult<bool> {
        let backup = self.settings.backup_path();
        if !storage_exists(&backup) {
            return Ok(false);
        }
        delete_database_files(path)?;
        copy_file(&backup, path)?;
        info!(path = %path.display(), backup = %backup.display(), "restored database from backup");
        if let Some(listener) = &self.listener {
            listener.on_restored(path);
        }
        Ok(true)
    }
}

impl OpenHelper for SqliteOpenHelper {
    fn database(&self) -> CoreResult<Arc<dyn DatabaseWrapper>> {
        let db: Arc<dyn DatabaseWrapper> = self.session()?;
        Ok(db)
    }

    fn close_db(&self) -> CoreResult<()> {
        let db = {
            let mut session = self.session.lock();
            session.closed = true;
            session.db.take()
        };
        match db {
            Some(db) => Ok(db.close()?),
            None => Ok(()),
        }
    }

    fn backup_db(&self) -> CoreResult<()> {
        if !self.settings.can_backup() {
            return Err(CoreError::BackupNotEnabled {
                database: self.settings.name.clone(),
            });
        }
        if self.settings.in_memory {
            return Err(CoreError::invalid_operation(
                "in-memory databases have no backup file",
            ));
        }

        let db = self.session()?;
        let backup = self.settings.backup_path();
        let staging = staging_path(&backup);
        db.backup_to(&staging)?;
        fs::rename(&staging, &backup)?;
        info!(backup = %backup.display(), "backed up database");
        if let Some(listener) = &self.listener {
            listener.on_backed_up(&backup);
        }
        Ok(())
    }

    fn perform_restore_from_backup(&self) -> CoreResult<bool> {
        if self.settings.in_memory || !self.settings.can_backup() {
            return Ok(false);
        }
        let path = self.settings.file_path();
        if storage_exists(&path) && file_is_healthy(&path) {
            return Ok(false);
        }
        self.restore_backup(&path)
    }

    fn is_database_integrity_ok(&self) -> bool {
        self.session()
            .and_then(|db| Ok(db.integrity_ok()?))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SqliteOpenHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteOpenHelper")
            .field("settings", &self.settings)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Factory for [`SqliteOpenHelper`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteHelperFactory;

impl HandleFactory for SqliteHelperFactory {
    fn create_helper(
        &self,
        database: &Database,
        listener: Option<Arc<dyn DatabaseCallback>>,
    ) -> CoreResult<Arc<dyn OpenHelper>> {
        let settings = database.settings();
        let schema = SchemaHelper::new(
            Arc::clone(database.adapters()),
            Arc::clone(database.migrations()),
            settings.version,
            listener.clone(),
        );
        Ok(Arc::new(SqliteOpenHelper::new(settings, schema, listener)))
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn file_is_healthy(path: &Path) -> bool {
    match SqliteDatabase::open(path) {
        Ok(db) => {
            let ok = db.integrity_ok().unwrap_or(false);
            let _ = db.close();
            ok
        }
        Err(_) => false,
    }
}
