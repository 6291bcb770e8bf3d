//! Cross-crate integration scenarios.
//!
//! Each scenario drives a [`TestDatabase`] through the coordinator's public
//! surface and asserts the observable outcome. They are reused by this
//! crate's tests and can be run against custom configurations.

use crate::fixtures::{count_rows, user_row, TestDatabase};
use tabula_core::{CoreError, LifecycleState};

/// Transaction scenarios.
pub mod transaction {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Tests that a failing synchronous transaction rolls back every write.
    pub fn test_rollback_on_error(db: &TestDatabase) {
        db.users
            .insert(db, &user_row(1, "kept"))
            .expect("Failed to insert");

        let result: Result<(), CoreError> = db.execute_transaction(|conn| {
            conn.execute("INSERT INTO users VALUES (2, 'lost')", &[])?;
            conn.execute("UPDATE users SET name = 'changed' WHERE id = 1", &[])?;
            Err(CoreError::InvalidOperation {
                message: "Simulated abort".into(),
            })
        });
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));

        let rows = db.users.load_all(db).expect("Failed to load");
        assert_eq!(rows, vec![user_row(1, "kept")]);
    }

    /// Tests that async transactions run in submission order.
    pub fn test_async_submission_order(db: &TestDatabase) {
        let (tx, rx) = mpsc::channel();
        for id in 1..=2 {
            let done = tx.clone();
            db.begin_transaction_async(move |conn| {
                let before = conn.query("SELECT COUNT(*) FROM users", &[])?[0][0].as_i64();
                conn.execute(
                    "INSERT INTO users VALUES (?1, 'async')",
                    &[tabula_core::SqlValue::Integer(id)],
                )?;
                let _ = done.send((id, before));
                Ok(())
            })
            .name(format!("insert-{id}"))
            .build()
            .execute()
            .expect("Failed to enqueue");
        }

        let first = rx.recv_timeout(Duration::from_secs(5)).expect("A did not run");
        let second = rx.recv_timeout(Duration::from_secs(5)).expect("B did not run");
        assert_eq!(first, (1, Some(0)));
        assert_eq!(second, (2, Some(1)));
    }

    /// Tests that an async failure reports through the error callback only.
    pub fn test_async_failure_callbacks(db: &TestDatabase) {
        let (tx, rx) = mpsc::channel();
        let on_success = tx.clone();
        let on_error = tx.clone();
        let on_complete = tx;

        db.begin_transaction_async(|conn| {
            conn.execute("INSERT INTO users VALUES (1, 'a')", &[])?;
            conn.execute("INSERT INTO users VALUES (1, 'duplicate')", &[])?;
            Ok(())
        })
        .success(move || on_success.send("success").unwrap_or(()))
        .error(move |_| on_error.send("error").unwrap_or(()))
        .completion(move || on_complete.send("completion").unwrap_or(()))
        .build()
        .execute()
        .expect("Failed to enqueue");

        let events: Vec<&str> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("Missing callback"))
            .collect();
        assert_eq!(events, vec!["error", "completion"]);
        db.transaction_manager().wait_idle();
        assert_eq!(count_rows(db, "users"), 0);
    }
}

/// Lifecycle scenarios.
pub mod lifecycle {
    use super::*;

    /// Tests that reopen keeps the file and its data.
    pub fn test_reopen_preserves_data(db: &TestDatabase) {
        db.users
            .insert(db, &user_row(1, "ann"))
            .expect("Failed to insert");
        let lease = db.handle().expect("Failed to get handle");

        assert!(db.reopen(None).expect("Failed to reopen"));
        assert_eq!(db.lifecycle_state(), LifecycleState::Open);
        assert!(matches!(
            lease.database(),
            Err(CoreError::StaleHandle { .. })
        ));
        assert_eq!(count_rows(db, "users"), 1);
    }

    /// Tests that reset recreates an empty database.
    pub fn test_reset_recreates(db: &TestDatabase) {
        db.users
            .insert(db, &user_row(1, "ann"))
            .expect("Failed to insert");

        assert!(db.reset(None).expect("Failed to reset"));
        assert_eq!(db.lifecycle_state(), LifecycleState::Open);
        assert!(db.has_handle());
        assert_eq!(count_rows(db, "users"), 0);
        assert!(db.file_path().exists());
    }

    /// Tests that destroy removes the file and leaves the database closed.
    pub fn test_destroy_removes_file(db: &TestDatabase) {
        db.users
            .insert(db, &user_row(1, "ann"))
            .expect("Failed to insert");
        assert!(db.file_path().exists());

        assert!(db.destroy().expect("Failed to destroy"));
        assert_eq!(db.lifecycle_state(), LifecycleState::Closed);
        assert!(!db.has_handle());
        assert!(!db.file_path().exists());
        assert!(matches!(db.handle(), Err(CoreError::DatabaseClosed)));
    }
}

/// Backup scenarios.
pub mod backup {
    use super::*;
    use tabula_storage::delete_database_files;

    /// Tests that a missing file is restored from its backup on handle creation.
    pub fn test_restore_on_create(db: &TestDatabase) {
        db.users
            .insert(db, &user_row(1, "ann"))
            .expect("Failed to insert");
        db.backup_database().expect("Failed to back up");
        db.users
            .insert(db, &user_row(2, "after backup"))
            .expect("Failed to insert");

        db.close().expect("Failed to close");
        delete_database_files(&db.file_path()).expect("Failed to delete");
        assert!(db.reopen(None).expect("Failed to reopen"));

        let rows = db.users.load_all(db).expect("Failed to load");
        assert_eq!(rows, vec![user_row(1, "ann")]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{RecordingCallback, Reentry, ReentrantHandleFactory};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tabula_core::{DatabaseConfig, SqlValue};

    #[test]
    fn test_rollback_on_error() {
        transaction::test_rollback_on_error(&TestDatabase::new());
    }

    #[test]
    fn test_async_submission_order() {
        transaction::test_async_submission_order(&TestDatabase::new());
    }

    #[test]
    fn test_async_failure_callbacks() {
        transaction::test_async_failure_callbacks(&TestDatabase::new());
    }

    #[test]
    fn test_reopen_preserves_data() {
        lifecycle::test_reopen_preserves_data(&TestDatabase::new());
    }

    #[test]
    fn test_reset_recreates() {
        lifecycle::test_reset_recreates(&TestDatabase::new());
    }

    #[test]
    fn test_destroy_removes_file() {
        lifecycle::test_destroy_removes_file(&TestDatabase::new());
    }

    #[test]
    fn test_restore_on_create() {
        backup::test_restore_on_create(&TestDatabase::new());
    }

    #[test]
    fn test_backup_not_enabled() {
        let db = TestDatabase::with_settings(|s| s.backup_enabled(false));
        db.users.insert(&db, &user_row(1, "ann")).unwrap();
        assert!(matches!(
            db.backup_database(),
            Err(CoreError::BackupNotEnabled { .. })
        ));
        assert!(!db.settings().backup_path().exists());
    }

    #[test]
    fn test_backup_while_closed() {
        let db = TestDatabase::new();
        db.close().unwrap();
        assert!(matches!(db.backup_database(), Err(CoreError::DatabaseClosed)));
    }

    struct Reentrant {
        db: TestDatabase,
        factory: Arc<ReentrantHandleFactory>,
        events: Arc<RecordingCallback>,
        config: DatabaseConfig,
    }

    fn reentrant(reentry: Reentry) -> Reentrant {
        let factory = Arc::new(ReentrantHandleFactory::new(reentry));
        let events = Arc::new(RecordingCallback::new());
        let config = DatabaseConfig::new()
            .handle_factory(factory.clone())
            .callback(events.clone());
        let db = TestDatabase::with_config(&config);
        factory.attach(&db.db);
        Reentrant {
            db,
            factory,
            events,
            config,
        }
    }

    fn deletions(events: &RecordingCallback) -> usize {
        events.events().iter().filter(|e| *e == "deleted").count()
    }

    #[test]
    fn test_destroy_is_not_reentrant() {
        for reentry in [Reentry::Destroy, Reentry::Reset, Reentry::Reopen, Reentry::Close] {
            let Reentrant {
                db, factory, events, ..
            } = reentrant(reentry);
            db.users.insert(&db, &user_row(1, "ann")).unwrap();

            assert!(db.destroy().unwrap());
            assert_eq!(factory.results(), vec![Ok(false)], "{reentry:?}");
            assert_eq!(deletions(&events), 1, "{reentry:?}");
            // Built once, closed once, never rebuilt by the nested call.
            assert_eq!(factory.counters.snapshot(), (1, 1, 1), "{reentry:?}");
            assert_eq!(db.lifecycle_state(), LifecycleState::Closed);
            assert!(!db.is_resetting());
            assert!(!db.file_path().exists());
        }
    }

    #[test]
    fn test_nested_reset_during_reset_is_skipped() {
        let Reentrant {
            db,
            factory,
            events,
            config,
        } = reentrant(Reentry::Reset);
        db.users.insert(&db, &user_row(1, "ann")).unwrap();

        assert!(db.reset(Some(&config)).unwrap());
        assert_eq!(factory.results(), vec![Ok(false)]);
        assert_eq!(deletions(&events), 1);
        assert_eq!(factory.counters.snapshot(), (2, 2, 1));
        assert_eq!(db.lifecycle_state(), LifecycleState::Open);
        assert_eq!(count_rows(&db, "users"), 0);
    }

    #[test]
    fn test_failed_construction_is_retried() {
        let factory = Arc::new(crate::fixtures::CountingHandleFactory::new().failing(1));
        let config = DatabaseConfig::new().handle_factory(factory.clone());
        let db = TestDatabase::with_config(&config);

        assert!(matches!(db.handle(), Err(CoreError::HandleCreation { .. })));
        assert!(!db.has_handle());
        db.users.insert(&db, &user_row(1, "ann")).unwrap();
        assert_eq!(factory.counters.snapshot(), (2, 1, 0));
    }

    #[test]
    fn test_reset_discards_handle_built_under_old_config() {
        let factory = Arc::new(
            crate::fixtures::CountingHandleFactory::new()
                .with_settle_delay(Duration::from_millis(300)),
        );
        let config = DatabaseConfig::new().handle_factory(factory.clone());
        let db = TestDatabase::with_config(&config);
        let old_path = db.file_path();

        let opener = {
            let db = Arc::clone(&db.db);
            thread::spawn(move || db.handle().map(|lease| lease.is_current()))
        };
        thread::sleep(Duration::from_millis(50));

        let other = DatabaseConfig::new().database_name("other");
        assert!(db.reset(Some(&other)).unwrap());
        assert!(opener.join().unwrap().unwrap());
        db.users.insert(&db, &user_row(1, "ann")).unwrap();

        assert!(db.file_path().ends_with("other.db"));
        assert!(db.file_path().exists());
        assert!(!old_path.exists());
        assert_eq!(count_rows(&db, "users"), 1);
        // The old-config handle was built once and thrown away.
        assert_eq!(factory.counters.snapshot(), (1, 1, 1));
    }

    #[test]
    fn test_reset_applies_new_config() {
        let db = TestDatabase::new();
        db.users.insert(&db, &user_row(1, "ann")).unwrap();

        let config = DatabaseConfig::new().database_name("other");
        assert!(db.reset(Some(&config)).unwrap());
        assert!(db.file_path().ends_with("other.db"));
        assert_eq!(
            db.users.load_all(&db).unwrap(),
            Vec::<Vec<SqlValue>>::new()
        );
    }
}
