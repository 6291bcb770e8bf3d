//! The database coordinator.

use crate::adapter::{AdapterRegistry, ModelAdapter, StatementKind};
use crate::config::{DatabaseConfig, DatabaseSettings};
use crate::error::{CoreError, CoreResult};
use crate::handle::{
    DatabaseCallback, HandleFactory, HandleLease, OpenHelper, SqliteHelperFactory,
};
use crate::lifecycle::{LifecycleState, ResetGuard};
use crate::migration::{Migration, MigrationRegistry, SchemaVersion};
use crate::notify::{DeferredNotifier, DirectModelNotifier, ModelNotifier, PendingChanges};
use crate::transaction::{
    DefaultTransactionManager, TransactionBuilder, TransactionGuard, TransactionManager,
};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tabula_storage::{delete_database_files, DatabaseWrapper};
use tracing::{debug, info, warn};

/// The schema description of one logical database.
///
/// Produced ahead of time (typically by a schema compiler) and consumed by
/// [`Database::new`].
pub struct DatabaseDefinition {
    settings: DatabaseSettings,
    adapters: Vec<Arc<dyn ModelAdapter>>,
    migrations: MigrationRegistry,
}

impl DatabaseDefinition {
    /// Starts a definition with the given settings.
    #[must_use]
    pub fn new(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            adapters: Vec::new(),
            migrations: MigrationRegistry::new(),
        }
    }

    /// Adds an entity adapter.
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn ModelAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Adds a migration step for `version`, after any already added for it.
    #[must_use]
    pub fn migration(mut self, version: SchemaVersion, step: Arc<dyn Migration>) -> Self {
        self.migrations.register(version, step);
        self
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }
}

impl std::fmt::Debug for DatabaseDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseDefinition")
            .field("settings", &self.settings)
            .field("adapters", &self.adapters.len())
            .field("migrations", &self.migrations)
            .finish()
    }
}

/// Everything derived from the configuration. Rebuilt on every apply.
struct Applied {
    settings: DatabaseSettings,
    handle_factory: Arc<dyn HandleFactory>,
    notifier: Option<Arc<dyn ModelNotifier>>,
    transaction_manager: Arc<dyn TransactionManager>,
    callback: Option<Arc<dyn DatabaseCallback>>,
    /// Counts applies; a handle built under an older epoch is never published.
    epoch: u64,
}

impl Applied {
    fn build(
        base: &DatabaseSettings,
        adapters: &AdapterRegistry,
        config: Option<&DatabaseConfig>,
    ) -> Self {
        let settings = base.with_overrides(config);

        if let Some(config) = config {
            for (entity_type, (entity, table)) in &config.tables {
                let Some(adapter) = adapters.lookup_by_type(*entity_type) else {
                    debug!(entity, "no adapter for configured entity, skipping");
                    continue;
                };
                if let Some(loader) = &table.loader {
                    adapter.set_loader(Arc::clone(loader));
                }
                if let Some(saver) = &table.saver {
                    adapter.set_saver(Arc::clone(saver));
                }
            }
        }

        let transaction_manager: Arc<dyn TransactionManager> =
            match config.and_then(|c| c.transaction_manager_factory.as_ref()) {
                Some(factory) => factory.create_manager(&settings.name),
                None => Arc::new(DefaultTransactionManager::new(&settings.name)),
            };
        let handle_factory: Arc<dyn HandleFactory> =
            match config.and_then(|c| c.handle_factory.clone()) {
                Some(factory) => factory,
                None => Arc::new(SqliteHelperFactory),
            };

        Self {
            handle_factory,
            notifier: config.and_then(|c| c.notifier.clone()),
            callback: config.and_then(|c| c.callback.clone()),
            transaction_manager,
            settings,
            epoch: 0,
        }
    }
}

/// Coordinates the lifecycle of one logical database.
///
/// `Database` owns:
/// - The adapter and migration registries built from the definition
/// - The configuration applied on construction and on every reset/reopen
/// - The single lazily created storage handle
/// - The asynchronous transaction queue
///
/// # Opening a Database
///
/// ```rust,ignore
/// use tabula_core::{Database, DatabaseDefinition, DatabaseSettings, SchemaAdapter};
///
/// let users = Arc::new(SchemaAdapter::table::<User>("users").column("id", "INTEGER"));
/// let db = Database::new(
///     DatabaseDefinition::new(DatabaseSettings::new("app").directory("data"))
///         .adapter(users.clone()),
///     None,
/// )?;
///
/// db.execute_transaction(|conn| {
///     conn.execute("INSERT INTO users (id) VALUES (1)", &[])?;
///     Ok(())
/// })?;
/// ```
///
/// # Lifecycle
///
/// [`close`](Self::close), [`destroy`](Self::destroy), [`reset`](Self::reset)
/// and [`reopen`](Self::reopen) tear the handle down in a fixed order: stop
/// the queue, release every adapter's prepared statements, close the handle.
/// Destroy, reset and reopen share one re-entrancy flag; a call made while
/// another is running is skipped and returns `Ok(false)`.
pub struct Database {
    base_settings: DatabaseSettings,
    adapters: Arc<AdapterRegistry>,
    migrations: Arc<MigrationRegistry>,
    applied: RwLock<Applied>,
    default_notifier: OnceLock<Arc<DirectModelNotifier>>,
    pending_changes: PendingChanges,
    handle: RwLock<Option<Arc<dyn OpenHelper>>>,
    /// Serializes handle construction.
    init_lock: Mutex<()>,
    /// Bumped on every handle construction and every close.
    generation: Arc<AtomicU64>,
    state: Mutex<LifecycleState>,
    resetting: AtomicBool,
    self_ref: Weak<Database>,
}

impl Database {
    /// Builds the coordinator and applies `config`.
    ///
    /// No storage is touched until the handle is first needed.
    ///
    /// # Errors
    ///
    /// Duplicate entity types or table names in the definition fail with
    /// [`CoreError::DuplicateEntityType`] / [`CoreError::DuplicateEntityName`].
    pub fn new(
        definition: DatabaseDefinition,
        config: Option<&DatabaseConfig>,
    ) -> CoreResult<Arc<Self>> {
        let DatabaseDefinition {
            settings,
            adapters,
            migrations,
        } = definition;

        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter)?;
        }
        let applied = Applied::build(&settings, &registry, config);

        info!(
            database = %applied.settings.name,
            adapters = registry.len(),
            version = settings.version,
            "database defined"
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            base_settings: settings,
            adapters: Arc::new(registry),
            migrations: Arc::new(migrations),
            applied: RwLock::new(applied),
            default_notifier: OnceLock::new(),
            pending_changes: PendingChanges::default(),
            handle: RwLock::new(None),
            init_lock: Mutex::new(()),
            generation: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(LifecycleState::Open),
            resetting: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    /// Builds the coordinator without external configuration.
    pub fn open(definition: DatabaseDefinition) -> CoreResult<Arc<Self>> {
        Self::new(definition, None)
    }

    // ------------------------------------------------------------------
    // Registries and configuration
    // ------------------------------------------------------------------

    /// Returns the adapter registry.
    #[must_use]
    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    /// Returns the migration registry.
    #[must_use]
    pub fn migrations(&self) -> &Arc<MigrationRegistry> {
        &self.migrations
    }

    /// Returns the adapter for entity type `T`.
    #[must_use]
    pub fn adapter<T: 'static>(&self) -> Option<&Arc<dyn ModelAdapter>> {
        self.adapters.lookup::<T>()
    }

    /// Re-applies configuration.
    ///
    /// Hook overrides are installed on the named adapters; the notifier,
    /// handle factory, transaction manager, callback and settings overrides
    /// are replaced wholesale, falling back to defaults where `config` is
    /// silent. The previous transaction manager is dropped, which stops its
    /// queue.
    pub fn apply_config(&self, config: Option<&DatabaseConfig>) {
        let mut applied = Applied::build(&self.base_settings, &self.adapters, config);
        let previous = {
            let mut slot = self.applied.write();
            applied.epoch = slot.epoch + 1;
            std::mem::replace(&mut *slot, applied)
        };
        drop(previous);
        debug!(database = %self.base_settings.name, "applied configuration");
    }

    /// Returns the effective settings.
    #[must_use]
    pub fn settings(&self) -> DatabaseSettings {
        self.applied.read().settings.clone()
    }

    /// Returns the path of the database file.
    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.applied.read().settings.file_path()
    }

    /// Returns the change notifier: the configured one, or the default.
    #[must_use]
    pub fn notifier(&self) -> Arc<dyn ModelNotifier> {
        if let Some(notifier) = &self.applied.read().notifier {
            return Arc::clone(notifier);
        }
        self.default_notifier()
    }

    /// Returns the notifier savers write through: changes made inside
    /// [`execute_transaction`](Self::execute_transaction) wait for the
    /// outermost commit.
    pub(crate) fn change_notifier(&self) -> DeferredNotifier<'_> {
        DeferredNotifier {
            pending: &self.pending_changes,
            target: self.notifier(),
        }
    }

    /// Returns the default notifier, creating it on first use.
    #[must_use]
    pub fn default_notifier(&self) -> Arc<DirectModelNotifier> {
        Arc::clone(
            self.default_notifier
                .get_or_init(|| Arc::new(DirectModelNotifier::new())),
        )
    }

    /// Returns the transaction manager.
    #[must_use]
    pub fn transaction_manager(&self) -> Arc<dyn TransactionManager> {
        Arc::clone(&self.applied.read().transaction_manager)
    }

    // ------------------------------------------------------------------
    // Handle
    // ------------------------------------------------------------------

    /// Returns a lease on the storage handle, creating the handle on first use.
    ///
    /// Construction runs once however many threads race here. The new
    /// handle's restore-from-backup pass completes before any caller sees it.
    /// If construction or restore fails, nothing is cached and the next call
    /// retries. A handle whose construction overlapped a close or a config
    /// apply is discarded and built again from the current configuration.
    ///
    /// # Errors
    ///
    /// [`CoreError::DatabaseClosed`] after [`close`](Self::close) or
    /// [`destroy`](Self::destroy), [`CoreError::InvalidOperation`] while a
    /// destructive sequence runs, or the construction failure.
    pub fn handle(&self) -> CoreResult<HandleLease> {
        self.ensure_open()?;
        if let Some(lease) = self.cached_lease() {
            return Ok(lease);
        }

        let _init = self.init_lock.lock();
        loop {
            self.ensure_open()?;
            if let Some(lease) = self.cached_lease() {
                return Ok(lease);
            }

            let (factory, callback, epoch, started) = {
                let applied = self.applied.read();
                (
                    Arc::clone(&applied.handle_factory),
                    applied.callback.clone(),
                    applied.epoch,
                    self.generation(),
                )
            };
            let helper = factory.create_helper(self, callback)?;
            let restored = match helper.perform_restore_from_backup() {
                Ok(restored) => restored,
                Err(e) => {
                    let _ = helper.close_db();
                    return Err(e);
                }
            };

            let mut slot = self.handle.write();
            if let Err(e) = self.ensure_open() {
                drop(slot);
                let _ = helper.close_db();
                return Err(e);
            }
            if self.applied.read().epoch != epoch || self.generation() != started {
                drop(slot);
                let _ = helper.close_db();
                debug!(
                    database = %self.base_settings.name,
                    "configuration changed during handle construction, rebuilding"
                );
                continue;
            }
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *slot = Some(Arc::clone(&helper));
            info!(database = %self.base_settings.name, generation, restored, "created storage handle");
            return Ok(HandleLease::new(helper, Arc::clone(&self.generation)));
        }
    }

    fn ensure_open(&self) -> CoreResult<()> {
        match self.lifecycle_state() {
            LifecycleState::Open => Ok(()),
            LifecycleState::Resetting => Err(CoreError::invalid_operation(
                "database is being reset",
            )),
            LifecycleState::Closing | LifecycleState::Closed => Err(CoreError::DatabaseClosed),
        }
    }

    fn cached_lease(&self) -> Option<HandleLease> {
        // Generation is read under the slot lock so a lease never pairs a
        // handle with a later generation.
        let slot = self.handle.read();
        slot.as_ref()
            .map(|helper| HandleLease::new(Arc::clone(helper), Arc::clone(&self.generation)))
    }

    /// Returns the engine session of the current handle.
    pub fn writable_database(&self) -> CoreResult<Arc<dyn DatabaseWrapper>> {
        self.handle()?.database()
    }

    /// Returns true if a handle is cached.
    #[must_use]
    pub fn has_handle(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Returns the current handle generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Runs the engine's consistency check on the current handle.
    pub fn is_database_integrity_ok(&self) -> CoreResult<bool> {
        Ok(self.handle()?.open_helper()?.is_database_integrity_ok())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Runs `work` in a transaction on the calling thread.
    ///
    /// Commits if `work` returns `Ok`. Otherwise the transaction rolls back
    /// and the original error is returned. Table changes reported during
    /// `work` reach the notifier only after the outermost commit.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let id = db.execute_transaction(|conn| {
    ///     conn.execute("INSERT INTO notes (body) VALUES ('hi')", &[])?;
    ///     Ok(conn.query("SELECT last_insert_rowid()", &[])?[0][0].as_i64())
    /// })?;
    /// ```
    pub fn execute_transaction<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&dyn DatabaseWrapper) -> CoreResult<T>,
    {
        let db = self.writable_database()?;
        let mut guard = TransactionGuard::begin(db.as_ref())?;
        let scope = self.pending_changes.enter();
        let value = work(db.as_ref())?;
        guard.mark_successful()?;
        guard.end()?;

        let changes = scope.finish(true);
        if !changes.is_empty() {
            let notifier = self.notifier();
            for (table, action) in changes {
                notifier.notify_table_changed(&table, action);
            }
        }
        Ok(value)
    }

    /// Prepares `work` to run on the asynchronous queue.
    ///
    /// Nothing runs until the returned builder is built and executed.
    /// Executed transactions run one at a time in submission order.
    pub fn begin_transaction_async<F>(&self, work: F) -> TransactionBuilder
    where
        F: FnOnce(&dyn DatabaseWrapper) -> CoreResult<()> + Send + 'static,
    {
        TransactionBuilder::new(self.self_ref.clone(), Box::new(work))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Returns the lifecycle state.
    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Returns true while destroy, reset or reopen is running.
    #[must_use]
    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock() = state;
    }

    /// Closes the database.
    ///
    /// Skipped (returns `Ok(false)`) while a destructive sequence runs.
    pub fn close(&self) -> CoreResult<bool> {
        if self.is_resetting() {
            debug!(database = %self.base_settings.name, "close skipped while resetting");
            return Ok(false);
        }
        self.close_inner()?;
        Ok(true)
    }

    fn close_inner(&self) -> CoreResult<()> {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Open {
                *state = LifecycleState::Closing;
            }
        }

        self.transaction_manager().stop_queue();

        for adapter in self.adapters.all() {
            for kind in StatementKind::ALL {
                if let Err(e) = adapter.close_statement(kind) {
                    warn!(
                        table = adapter.table_name(),
                        ?kind,
                        error = %e,
                        "failed to release statement"
                    );
                }
            }
        }

        let helper = {
            let mut slot = self.handle.write();
            self.generation.fetch_add(1, Ordering::AcqRel);
            slot.take()
        };
        let result = match &helper {
            Some(helper) => helper.close_db(),
            None => Ok(()),
        };

        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Closing {
                *state = LifecycleState::Closed;
            }
        }
        info!(database = %self.base_settings.name, had_handle = helper.is_some(), "closed database");
        result
    }

    /// Closes the database and deletes its files.
    ///
    /// The database file, its side files and its backup are removed. Ends
    /// `Closed`.
    pub fn destroy(&self) -> CoreResult<bool> {
        let Some(_guard) = ResetGuard::acquire(&self.resetting) else {
            debug!(database = %self.base_settings.name, "destroy skipped, already resetting");
            return Ok(false);
        };
        self.set_state(LifecycleState::Resetting);
        let result = self.destroy_inner();
        self.set_state(LifecycleState::Closed);
        result.map(|()| true)
    }

    fn destroy_inner(&self) -> CoreResult<()> {
        let closed = self.close_inner();

        let settings = self.settings();
        if !settings.in_memory {
            let path = settings.file_path();
            let existed = delete_database_files(&path)?;
            delete_database_files(&settings.backup_path())?;
            info!(path = %path.display(), existed, "deleted database");
            let callback = self.applied.read().callback.clone();
            if let Some(callback) = callback {
                callback.on_deleted(&path);
            }
        }
        *self.handle.write() = None;
        closed
    }

    /// Destroys the database, re-applies `config` and opens a fresh handle.
    pub fn reset(&self, config: Option<&DatabaseConfig>) -> CoreResult<bool> {
        let Some(_guard) = ResetGuard::acquire(&self.resetting) else {
            debug!(database = %self.base_settings.name, "reset skipped, already resetting");
            return Ok(false);
        };
        self.set_state(LifecycleState::Resetting);
        let result = self
            .destroy_inner()
            .and_then(|()| self.restart(config));
        if result.is_err() {
            self.set_state(LifecycleState::Closed);
        }
        info!(database = %self.base_settings.name, ok = result.is_ok(), "reset database");
        result.map(|()| true)
    }

    /// Closes the database, keeping its file, re-applies `config` and opens
    /// a fresh handle.
    pub fn reopen(&self, config: Option<&DatabaseConfig>) -> CoreResult<bool> {
        let Some(_guard) = ResetGuard::acquire(&self.resetting) else {
            debug!(database = %self.base_settings.name, "reopen skipped, already resetting");
            return Ok(false);
        };
        self.set_state(LifecycleState::Resetting);
        let result = self.close_inner().and_then(|()| {
            *self.handle.write() = None;
            self.restart(config)
        });
        if result.is_err() {
            self.set_state(LifecycleState::Closed);
        }
        info!(database = %self.base_settings.name, ok = result.is_ok(), "reopened database");
        result.map(|()| true)
    }

    fn restart(&self, config: Option<&DatabaseConfig>) -> CoreResult<()> {
        self.apply_config(config);
        self.set_state(LifecycleState::Open);
        self.handle().map(drop)
    }

    /// Backs up the database through the current handle.
    ///
    /// # Errors
    ///
    /// [`CoreError::BackupNotEnabled`] unless backups or consistency checks
    /// were enabled in the settings; [`CoreError::DatabaseClosed`] unless the
    /// database is open.
    pub fn backup_database(&self) -> CoreResult<()> {
        let settings = self.settings();
        if !settings.can_backup() {
            return Err(CoreError::BackupNotEnabled {
                database: settings.name,
            });
        }
        if self.lifecycle_state() != LifecycleState::Open {
            return Err(CoreError::DatabaseClosed);
        }
        self.handle()?.open_helper()?.backup_db()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.base_settings.name)
            .field("state", &self.lifecycle_state())
            .field("generation", &self.generation())
            .field("has_handle", &self.has_handle())
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.has_handle() {
            let _ = self.close_inner();
        }
    }
}
