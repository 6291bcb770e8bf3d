//! Property-based test generators using proptest.

use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use std::collections::BTreeMap;
use tabula_core::SchemaVersion;

/// Generates short lowercase names.
pub fn arb_name() -> impl Strategy<Value = String> {
    "[a-z]{1,12}"
}

/// Generates users keyed by unique id.
pub fn arb_users(max: usize) -> impl Strategy<Value = BTreeMap<i64, String>> {
    btree_map(1i64..10_000, arb_name(), 0..max)
}

/// Generates a migration plan: schema version to number of steps.
///
/// Versions start at 2 so version 1 stays the baseline schema.
pub fn arb_migration_plan() -> impl Strategy<Value = BTreeMap<SchemaVersion, usize>> {
    btree_map(2i64..10, 1usize..4, 1..5)
}

/// Generates a sequence of lifecycle operations.
pub fn arb_lifecycle_ops(max: usize) -> impl Strategy<Value = Vec<LifecycleOp>> {
    vec(
        prop_oneof![
            3 => Just(LifecycleOp::Write),
            1 => Just(LifecycleOp::Close),
            1 => Just(LifecycleOp::Reopen),
            1 => Just(LifecycleOp::Reset),
            1 => Just(LifecycleOp::Destroy),
        ],
        1..max,
    )
}

/// An operation applied by lifecycle property tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    /// Insert one row.
    Write,
    /// `close()`.
    Close,
    /// `reopen(None)`.
    Reopen,
    /// `reset(None)`.
    Reset,
    /// `destroy()`.
    Destroy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{count_rows, user_row, TestDatabase};
    use std::sync::Arc;
    use tabula_core::migration::SqlMigration;
    use tabula_core::{
        CoreError, Database, DatabaseDefinition, DatabaseSettings, LifecycleState, SchemaAdapter,
        SqlValue,
    };

    struct LogEntry;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn failed_transaction_leaves_no_rows(users in arb_users(20)) {
            let db = TestDatabase::with_settings(|s| s.in_memory(true));
            let result = db.execute_transaction(|conn| {
                for (id, name) in &users {
                    conn.execute(
                        "INSERT INTO users (id, name) VALUES (?1, ?2)",
                        &user_row(*id, name),
                    )?;
                }
                Err::<(), _>(CoreError::transaction_aborted("rollback"))
            });
            prop_assert!(result.is_err());
            prop_assert_eq!(count_rows(&db, "users"), 0);
        }

        #[test]
        fn migrations_run_in_version_order(plan in arb_migration_plan()) {
            let target = *plan.keys().max().unwrap();
            let log = Arc::new(
                SchemaAdapter::table::<LogEntry>("migration_log")
                    .column("version", "INTEGER")
                    .column("step", "INTEGER"),
            );
            let mut definition = DatabaseDefinition::new(
                DatabaseSettings::new("plan").in_memory(true).version(target),
            )
            .adapter(log);
            for (version, steps) in &plan {
                for step in 0..*steps {
                    definition = definition.migration(
                        *version,
                        Arc::new(SqlMigration::new(
                            format!("v{version}s{step}"),
                            format!("INSERT INTO migration_log VALUES ({version}, {step})"),
                        )),
                    );
                }
            }

            let db = Database::open(definition).unwrap();
            let rows = db
                .writable_database()
                .unwrap()
                .query("SELECT version, step FROM migration_log ORDER BY rowid", &[])
                .unwrap();
            let expected: Vec<Vec<SqlValue>> = plan
                .iter()
                .flat_map(|(version, steps)| {
                    (0..*steps as i64)
                        .map(move |step| vec![SqlValue::Integer(*version), SqlValue::Integer(step)])
                })
                .collect();
            prop_assert_eq!(rows, expected);
        }

        #[test]
        fn lifecycle_sequences_keep_invariants(ops in arb_lifecycle_ops(12)) {
            let db = TestDatabase::new();
            let mut next_id = 0;
            for op in ops {
                match op {
                    LifecycleOp::Write => {
                        next_id += 1;
                        let result = db.users.insert(&db, &user_row(next_id, "x"));
                        if db.lifecycle_state() == LifecycleState::Open {
                            prop_assert!(result.is_ok());
                        } else {
                            prop_assert!(matches!(result, Err(CoreError::DatabaseClosed)));
                        }
                    }
                    LifecycleOp::Close => {
                        prop_assert!(db.close().unwrap());
                        prop_assert_eq!(db.lifecycle_state(), LifecycleState::Closed);
                    }
                    LifecycleOp::Reopen => {
                        prop_assert!(db.reopen(None).unwrap());
                        prop_assert_eq!(db.lifecycle_state(), LifecycleState::Open);
                    }
                    LifecycleOp::Reset => {
                        prop_assert!(db.reset(None).unwrap());
                        prop_assert_eq!(db.lifecycle_state(), LifecycleState::Open);
                        prop_assert_eq!(count_rows(&db, "users"), 0);
                    }
                    LifecycleOp::Destroy => {
                        prop_assert!(db.destroy().unwrap());
                        prop_assert_eq!(db.lifecycle_state(), LifecycleState::Closed);
                        prop_assert!(!db.file_path().exists());
                    }
                }
                prop_assert!(!db.is_resetting());
            }
        }
    }
}
