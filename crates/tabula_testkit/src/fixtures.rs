//! Test fixtures and database helpers.
//!
//! Provides a temporary database with a small sample schema plus
//! instrumented implementations of the coordinator's extension points.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;
use tabula_core::handle::SqliteHelperFactory;
use tabula_core::{
    ChangeAction, CoreError, CoreResult, Database, DatabaseCallback, DatabaseConfig,
    DatabaseDefinition, DatabaseSettings, DatabaseWrapper, HandleFactory, ModelNotifier,
    OpenHelper, SchemaAdapter, SqlValue,
};
use tempfile::TempDir;

/// Sample entity types.
pub mod schema {
    use super::*;

    /// A user row: `(id, name)`.
    pub struct User;

    /// A post row: `(id, user_id, title)`.
    pub struct Post;

    /// A view counting posts per user.
    pub struct PostCount;

    /// Adapter for [`User`].
    pub fn users() -> Arc<SchemaAdapter> {
        Arc::new(
            SchemaAdapter::table::<User>("users")
                .column("id", "INTEGER NOT NULL")
                .column("name", "TEXT NOT NULL")
                .primary_key("id"),
        )
    }

    /// Adapter for [`Post`].
    pub fn posts() -> Arc<SchemaAdapter> {
        Arc::new(
            SchemaAdapter::table::<Post>("posts")
                .column("id", "INTEGER NOT NULL")
                .column("user_id", "INTEGER NOT NULL REFERENCES users (id)")
                .column("title", "TEXT")
                .primary_key("id"),
        )
    }

    /// Adapter for [`PostCount`].
    pub fn post_counts() -> Arc<SchemaAdapter> {
        Arc::new(SchemaAdapter::view::<PostCount>(
            "post_counts",
            "SELECT user_id, COUNT(*) AS posts FROM posts GROUP BY user_id",
        ))
    }
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Arc<Database>,
    /// Adapter for the `users` table.
    pub users: Arc<SchemaAdapter>,
    /// Adapter for the `posts` table.
    pub posts: Arc<SchemaAdapter>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestDatabase {
    /// Creates a file-based test database with backups enabled.
    pub fn new() -> Self {
        Self::build(|settings| settings, None)
    }

    /// Creates a test database with `config` applied.
    pub fn with_config(config: &DatabaseConfig) -> Self {
        Self::build(|settings| settings, Some(config))
    }

    /// Creates a test database after adjusting the default settings.
    pub fn with_settings(adjust: impl FnOnce(DatabaseSettings) -> DatabaseSettings) -> Self {
        Self::build(adjust, None)
    }

    /// Creates a test database from adjusted settings and an optional config.
    pub fn build(
        adjust: impl FnOnce(DatabaseSettings) -> DatabaseSettings,
        config: Option<&DatabaseConfig>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let settings = adjust(
            DatabaseSettings::new("test")
                .directory(temp_dir.path())
                .backup_enabled(true)
                .foreign_keys(true),
        );
        let users = schema::users();
        let posts = schema::posts();
        let definition = DatabaseDefinition::new(settings)
            .adapter(users.clone())
            .adapter(posts.clone())
            .adapter(schema::post_counts());
        let db = Database::new(definition, config).expect("Failed to create database");

        Self {
            db,
            users,
            posts,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the temporary directory.
    pub fn dir(&self) -> &Path {
        self._temp_dir.path()
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary database.
///
/// # Example
///
/// ```rust,ignore
/// use tabula_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         db.users.insert(db, &user_row(1, "ann")).unwrap();
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&TestDatabase) -> R,
{
    let test_db = TestDatabase::new();
    f(&test_db)
}

/// Builds a `users` row.
pub fn user_row(id: i64, name: &str) -> Vec<SqlValue> {
    vec![SqlValue::Integer(id), name.into()]
}

/// Builds a `posts` row.
pub fn post_row(id: i64, user_id: i64, title: &str) -> Vec<SqlValue> {
    vec![SqlValue::Integer(id), SqlValue::Integer(user_id), title.into()]
}

/// Counts the rows of `table`.
pub fn count_rows(db: &Database, table: &str) -> i64 {
    db.writable_database()
        .expect("Failed to get database")
        .query(&format!("SELECT COUNT(*) FROM \"{table}\""), &[])
        .expect("Failed to count rows")[0][0]
        .as_i64()
        .expect("COUNT(*) is an integer")
}

// ----------------------------------------------------------------------
// Instrumented handles
// ----------------------------------------------------------------------

/// Counters shared by [`CountingHandleFactory`] and its handles.
#[derive(Debug, Default)]
pub struct HandleCounters {
    /// Handles constructed.
    pub created: AtomicUsize,
    /// Restore-from-backup passes run.
    pub restores: AtomicUsize,
    /// Handles closed.
    pub closed: AtomicUsize,
}

impl HandleCounters {
    /// Returns `(created, restores, closed)`.
    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.created.load(Ordering::SeqCst),
            self.restores.load(Ordering::SeqCst),
            self.closed.load(Ordering::SeqCst),
        )
    }
}

/// Wraps the SQLite factory and counts what happens to its handles.
///
/// Construction can be slowed down to widen race windows.
#[derive(Debug, Default)]
pub struct CountingHandleFactory {
    /// Shared counters.
    pub counters: Arc<HandleCounters>,
    delay: Duration,
    settle: Duration,
    /// Remaining constructions to fail before succeeding.
    failures: AtomicUsize,
}

impl CountingHandleFactory {
    /// Creates a factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` inside every construction.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleeps for `delay` after each handle is built, before returning it.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle = delay;
        self
    }

    /// Fails the next `count` constructions.
    pub fn failing(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }
}

impl HandleFactory for CountingHandleFactory {
    fn create_helper(
        &self,
        database: &Database,
        listener: Option<Arc<dyn DatabaseCallback>>,
    ) -> CoreResult<Arc<dyn OpenHelper>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(CoreError::handle_creation("injected failure"));
        }
        let inner = SqliteHelperFactory.create_helper(database, listener)?;
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        Ok(Arc::new(CountingHelper {
            inner,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct CountingHelper {
    inner: Arc<dyn OpenHelper>,
    counters: Arc<HandleCounters>,
}

impl OpenHelper for CountingHelper {
    fn database(&self) -> CoreResult<Arc<dyn DatabaseWrapper>> {
        self.inner.database()
    }

    fn close_db(&self) -> CoreResult<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close_db()
    }

    fn backup_db(&self) -> CoreResult<()> {
        self.inner.backup_db()
    }

    fn perform_restore_from_backup(&self) -> CoreResult<bool> {
        self.counters.restores.fetch_add(1, Ordering::SeqCst);
        self.inner.perform_restore_from_backup()
    }

    fn is_database_integrity_ok(&self) -> bool {
        self.inner.is_database_integrity_ok()
    }
}

/// What a [`ReentrantHandleFactory`] handle calls while it is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reentry {
    /// Call `close`.
    Close,
    /// Call `destroy`.
    Destroy,
    /// Call `reset(None)`.
    Reset,
    /// Call `reopen(None)`.
    Reopen,
}

/// Builds handles whose `close_db` calls back into the coordinator.
///
/// Attach the database after construction with [`attach`](Self::attach).
/// The outcome of each nested call is recorded in [`results`](Self::results).
#[derive(Debug)]
pub struct ReentrantHandleFactory {
    /// Shared counters.
    pub counters: Arc<HandleCounters>,
    reentry: Reentry,
    database: OnceLock<Weak<Database>>,
    results: Arc<Mutex<Vec<Result<bool, String>>>>,
}

impl ReentrantHandleFactory {
    /// Creates a factory performing `reentry` on every close.
    pub fn new(reentry: Reentry) -> Self {
        Self {
            counters: Arc::default(),
            reentry,
            database: OnceLock::new(),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sets the database the handles call back into.
    pub fn attach(&self, database: &Arc<Database>) {
        let _ = self.database.set(Arc::downgrade(database));
    }

    /// Returns the recorded nested-call outcomes.
    pub fn results(&self) -> Vec<Result<bool, String>> {
        self.results.lock().clone()
    }
}

impl HandleFactory for ReentrantHandleFactory {
    fn create_helper(
        &self,
        database: &Database,
        listener: Option<Arc<dyn DatabaseCallback>>,
    ) -> CoreResult<Arc<dyn OpenHelper>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ReentrantHelper {
            inner: SqliteHelperFactory.create_helper(database, listener)?,
            counters: Arc::clone(&self.counters),
            reentry: self.reentry,
            database: self.database.get().cloned().unwrap_or_default(),
            results: Arc::clone(&self.results),
        }))
    }
}

struct ReentrantHelper {
    inner: Arc<dyn OpenHelper>,
    counters: Arc<HandleCounters>,
    reentry: Reentry,
    database: Weak<Database>,
    results: Arc<Mutex<Vec<Result<bool, String>>>>,
}

impl OpenHelper for ReentrantHelper {
    fn database(&self) -> CoreResult<Arc<dyn DatabaseWrapper>> {
        self.inner.database()
    }

    fn close_db(&self) -> CoreResult<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        if let Some(database) = self.database.upgrade() {
            let outcome = match self.reentry {
                Reentry::Close => database.close(),
                Reentry::Destroy => database.destroy(),
                Reentry::Reset => database.reset(None),
                Reentry::Reopen => database.reopen(None),
            };
            self.results.lock().push(outcome.map_err(|e| e.to_string()));
        }
        self.inner.close_db()
    }

    fn backup_db(&self) -> CoreResult<()> {
        self.inner.backup_db()
    }

    fn perform_restore_from_backup(&self) -> CoreResult<bool> {
        self.counters.restores.fetch_add(1, Ordering::SeqCst);
        self.inner.perform_restore_from_backup()
    }

    fn is_database_integrity_ok(&self) -> bool {
        self.inner.is_database_integrity_ok()
    }
}

// ----------------------------------------------------------------------
// Recorders
// ----------------------------------------------------------------------

/// A notifier that records every change.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    changes: Mutex<Vec<(String, ChangeAction)>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded changes.
    pub fn changes(&self) -> Vec<(String, ChangeAction)> {
        self.changes.lock().clone()
    }
}

impl ModelNotifier for RecordingNotifier {
    fn notify_table_changed(&self, table: &str, action: ChangeAction) {
        self.changes.lock().push((table.to_string(), action));
    }
}

/// A callback that records lifecycle events by name.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<String>>,
}

impl RecordingCallback {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl DatabaseCallback for RecordingCallback {
    fn on_open(&self, _db: &dyn DatabaseWrapper) {
        self.events.lock().push("open".into());
    }

    fn on_create(&self, _db: &dyn DatabaseWrapper) {
        self.events.lock().push("create".into());
    }

    fn on_upgrade(&self, _db: &dyn DatabaseWrapper, old: i64, new: i64) {
        self.events.lock().push(format!("upgrade {old}->{new}"));
    }

    fn on_backed_up(&self, _path: &Path) {
        self.events.lock().push("backed_up".into());
    }

    fn on_restored(&self, _path: &Path) {
        self.events.lock().push("restored".into());
    }

    fn on_deleted(&self, _path: &Path) {
        self.events.lock().push("deleted".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::LifecycleState;

    #[test]
    fn test_database_creates_sample_schema() {
        let db = TestDatabase::new();
        db.users.insert(&db, &user_row(1, "ann")).unwrap();
        db.posts.insert(&db, &post_row(1, 1, "hello")).unwrap();
        db.posts.insert(&db, &post_row(2, 1, "again")).unwrap();

        assert_eq!(count_rows(&db, "users"), 1);
        let counts = db
            .writable_database()
            .unwrap()
            .query("SELECT posts FROM post_counts WHERE user_id = 1", &[])
            .unwrap();
        assert_eq!(counts[0][0], SqlValue::Integer(2));
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let db = TestDatabase::new();
        assert!(db.posts.insert(&db, &post_row(1, 99, "orphan")).is_err());
    }

    #[test]
    fn counting_factory_counts() {
        let factory = Arc::new(CountingHandleFactory::new());
        let config = DatabaseConfig::new().handle_factory(factory.clone());
        let db = TestDatabase::with_config(&config);

        db.handle().unwrap();
        db.handle().unwrap();
        assert_eq!(factory.counters.snapshot(), (1, 1, 0));

        db.close().unwrap();
        assert_eq!(factory.counters.snapshot(), (1, 1, 1));
        assert_eq!(db.lifecycle_state(), LifecycleState::Closed);
    }

    #[test]
    fn callback_sees_create_then_open() {
        let callback = Arc::new(RecordingCallback::new());
        let config = DatabaseConfig::new().callback(callback.clone());
        let db = TestDatabase::with_config(&config);

        db.writable_database().unwrap();
        db.backup_database().unwrap();
        assert_eq!(callback.events(), vec!["create", "open", "backed_up"]);
    }

    #[test]
    fn recording_notifier_sees_writes() {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = DatabaseConfig::new().notifier(notifier.clone());
        let db = TestDatabase::with_config(&config);

        db.users.insert(&db, &user_row(1, "ann")).unwrap();
        db.users.update(&db, &user_row(1, "bea")).unwrap();
        db.users.delete(&db, &SqlValue::Integer(1)).unwrap();

        let actions: Vec<ChangeAction> = notifier.changes().into_iter().map(|(_, a)| a).collect();
        assert_eq!(
            actions,
            vec![ChangeAction::Insert, ChangeAction::Update, ChangeAction::Delete]
        );
    }
}
