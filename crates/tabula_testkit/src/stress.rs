//! Stress tests for Tabula.
//!
//! These tests verify behavior under heavy load and concurrent access.

use crate::fixtures::user_row;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tabula_core::Database;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
        }
    }
}

/// Races `config.threads` threads on the first handle acquisition.
///
/// Every thread waits on a barrier, then calls `handle()` once.
pub fn stress_first_handle(db: &Arc<Database>, config: &StressConfig) -> StressTestResult {
    let barrier = Arc::new(Barrier::new(config.threads));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let db = Arc::clone(db);
            let barrier = Arc::clone(&barrier);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                barrier.wait();
                match db.handle() {
                    Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                };
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Runs synchronous single-row transactions from several threads.
///
/// Thread `t` writes ids `t * ops_per_thread + 1 ..`.
pub fn stress_concurrent_transactions(
    db: &Arc<Database>,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads;
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = Arc::clone(db);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let id = (t * ops_per_thread + i + 1) as i64;
                    let result = db.execute_transaction(|conn| {
                        conn.execute(
                            "INSERT INTO users (id, name) VALUES (?1, ?2)",
                            &user_row(id, "stress"),
                        )?;
                        Ok(())
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Submits async inserts from several threads and waits for all of them.
///
/// Returns the result plus the ids in the order the queue ran them.
pub fn stress_async_submissions(
    db: &Arc<Database>,
    config: &StressConfig,
) -> (StressTestResult, Vec<i64>) {
    let (tx, rx) = mpsc::channel();
    let ops_per_thread = config.operations / config.threads;
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = Arc::clone(db);
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let id = (t * ops_per_thread + i + 1) as i64;
                    let ok = tx.clone();
                    let err = tx.clone();
                    let queued = db
                        .begin_transaction_async(move |conn| {
                            conn.execute(
                                "INSERT INTO users (id, name) VALUES (?1, ?2)",
                                &user_row(id, "async"),
                            )?;
                            Ok(())
                        })
                        .success(move || ok.send(Ok(id)).unwrap_or(()))
                        .error(move |_| err.send(Err(id)).unwrap_or(()))
                        .build()
                        .execute();
                    if queued.is_err() {
                        let _ = tx.send(Err(id));
                    }
                }
            })
        })
        .collect();
    drop(tx);

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let mut order = Vec::new();
    let mut failed = 0;
    for outcome in rx.iter().take(ops_per_thread * config.threads) {
        match outcome {
            Ok(id) => order.push(id),
            Err(_) => failed += 1,
        }
    }

    (
        StressTestResult::new(order.len(), failed, start.elapsed()),
        order,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{count_rows, CountingHandleFactory, TestDatabase};
    use tabula_core::{CoreError, DatabaseConfig, LifecycleState};

    #[test]
    fn test_first_handle_is_built_once() {
        let factory =
            Arc::new(CountingHandleFactory::new().with_delay(Duration::from_millis(50)));
        let config = DatabaseConfig::new().handle_factory(factory.clone());
        let db = TestDatabase::with_config(&config);

        let result = stress_first_handle(
            &db.db,
            &StressConfig {
                threads: 16,
                ..Default::default()
            },
        );
        assert_eq!(result.successful_ops, 16);
        assert_eq!(factory.counters.snapshot(), (1, 1, 0));
    }

    #[test]
    fn test_concurrent_transactions() {
        let db = TestDatabase::new();
        let config = StressConfig {
            operations: 400,
            threads: 4,
        };

        let result = stress_concurrent_transactions(&db.db, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 400);
        assert_eq!(count_rows(&db, "users"), 400);
    }

    #[test]
    fn test_async_submissions_preserve_per_thread_order() {
        let db = TestDatabase::new();
        let config = StressConfig {
            operations: 200,
            threads: 4,
        };

        let (result, order) = stress_async_submissions(&db.db, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(order.len(), 200);
        for t in 0..4i64 {
            let ids: Vec<i64> = order
                .iter()
                .copied()
                .filter(|id| (id - 1) / 50 == t)
                .collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            assert_eq!(ids, sorted);
        }
        assert_eq!(count_rows(&db, "users"), 200);
    }

    #[test]
    fn test_reopen_under_load_fences_old_leases() {
        let db = TestDatabase::new();
        let lease = db.handle().unwrap();
        let writer = {
            let db = Arc::clone(&db.db);
            thread::spawn(move || {
                let mut errors = Vec::new();
                for id in 1..=200 {
                    if let Err(e) = db.execute_transaction(|conn| {
                        conn.execute(
                            "INSERT INTO users (id, name) VALUES (?1, ?2)",
                            &user_row(id, "w"),
                        )?;
                        Ok(())
                    }) {
                        errors.push(e);
                    }
                }
                errors
            })
        };

        for _ in 0..5 {
            db.reopen(None).unwrap();
        }
        let errors = writer.join().unwrap();

        assert!(!lease.is_current());
        assert_eq!(db.lifecycle_state(), LifecycleState::Open);
        for e in &errors {
            assert!(
                matches!(
                    e,
                    CoreError::StaleHandle { .. }
                        | CoreError::InvalidOperation { .. }
                        | CoreError::DatabaseClosed
                        | CoreError::Storage(_)
                ),
                "unexpected error: {e}"
            );
        }
        assert_eq!(count_rows(&db, "users") + errors.len() as i64, 200);
    }
}
