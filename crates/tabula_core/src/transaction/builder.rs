//! Asynchronous transaction builder.

use super::queue::QueuedTransaction;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tabula_storage::DatabaseWrapper;
use tracing::{debug, warn};

type Work = Box<dyn FnOnce(&dyn DatabaseWrapper) -> CoreResult<()> + Send>;
type Callback = Box<dyn FnOnce() + Send>;
type ErrorCallback = Box<dyn FnOnce(&CoreError) + Send>;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

/// Configures an asynchronous transaction before it is built.
///
/// Returned by [`Database::begin_transaction_async`].
#[must_use = "a builder does nothing until built and executed"]
pub struct TransactionBuilder {
    database: Weak<Database>,
    work: Work,
    name: Option<String>,
    success: Option<Callback>,
    error: Option<ErrorCallback>,
    completion: Option<Callback>,
    run_in_transaction: bool,
}

impl TransactionBuilder {
    pub(crate) fn new(database: Weak<Database>, work: Work) -> Self {
        Self {
            database,
            work,
            name: None,
            success: None,
            error: None,
            completion: None,
            run_in_transaction: true,
        }
    }

    /// Names the transaction so it can be cancelled by name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Called after the work succeeded (and committed).
    pub fn success(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.success = Some(Box::new(callback));
        self
    }

    /// Called with the failure after the work failed (and rolled back).
    pub fn error(mut self, callback: impl FnOnce(&CoreError) + Send + 'static) -> Self {
        self.error = Some(Box::new(callback));
        self
    }

    /// Called last, whatever the outcome.
    pub fn completion(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.completion = Some(Box::new(callback));
        self
    }

    /// Whether the work runs inside a transaction. Defaults to true.
    pub fn run_in_transaction(mut self, value: bool) -> Self {
        self.run_in_transaction = value;
        self
    }

    /// Finalizes the configuration.
    pub fn build(self) -> AsyncTransaction {
        AsyncTransaction {
            builder: self,
            state: Arc::new(AtomicU8::new(QUEUED)),
        }
    }
}

impl std::fmt::Debug for TransactionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBuilder")
            .field("name", &self.name)
            .field("run_in_transaction", &self.run_in_transaction)
            .finish_non_exhaustive()
    }
}

/// A built asynchronous transaction.
#[must_use = "an async transaction does nothing until executed"]
pub struct AsyncTransaction {
    builder: TransactionBuilder,
    state: Arc<AtomicU8>,
}

impl AsyncTransaction {
    /// Enqueues the transaction on the database's queue.
    ///
    /// # Errors
    ///
    /// [`CoreError::DatabaseClosed`] if the database was dropped, or
    /// [`CoreError::QueueStopped`] if its queue no longer accepts work.
    pub fn execute(self) -> CoreResult<TransactionHandle> {
        let database = self
            .builder
            .database
            .upgrade()
            .ok_or(CoreError::DatabaseClosed)?;
        let handle = TransactionHandle {
            name: self.builder.name.clone(),
            state: Arc::clone(&self.state),
        };
        let name = self.builder.name.clone();
        let state = self.state;
        let builder = self.builder;

        database
            .transaction_manager()
            .add_transaction(QueuedTransaction::new(name, move || {
                if state
                    .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    debug!(transaction = ?builder.name, "skipping cancelled transaction");
                    return;
                }
                // Failures reach the error callback or the log inside `run`.
                let _ = run(builder);
                state.store(FINISHED, Ordering::Release);
            }))?;
        Ok(handle)
    }

    /// Runs the transaction on the calling thread, bypassing the queue.
    ///
    /// Callbacks fire as they would on the queue; the outcome is also
    /// returned.
    pub fn execute_sync(self) -> CoreResult<()> {
        self.state.store(RUNNING, Ordering::Release);
        let result = run(self.builder);
        self.state.store(FINISHED, Ordering::Release);
        result
    }

    /// Discards the transaction without running it.
    pub fn cancel(self) {
        self.state.store(CANCELLED, Ordering::Release);
    }
}

impl std::fmt::Debug for AsyncTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTransaction")
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

/// Tracks a queued transaction.
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    name: Option<String>,
    state: Arc<AtomicU8>,
}

impl TransactionHandle {
    /// Cancels the transaction if it has not started.
    ///
    /// Returns true if the transaction will not run.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    /// Returns true once the work has run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == FINISHED
    }

    /// Returns the transaction's name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

fn run(builder: TransactionBuilder) -> CoreResult<()> {
    let TransactionBuilder {
        database,
        work,
        name,
        success,
        error,
        completion,
        run_in_transaction,
    } = builder;

    let result = match database.upgrade() {
        Some(database) if run_in_transaction => database.execute_transaction(|db| work(db)),
        Some(database) => database
            .writable_database()
            .and_then(|db| work(db.as_ref())),
        None => Err(CoreError::DatabaseClosed),
    };

    match &result {
        Ok(()) => {
            if let Some(success) = success {
                success();
            }
        }
        Err(e) => match error {
            Some(error) => error(e),
            None => warn!(transaction = ?name, error = %e, "async transaction failed"),
        },
    }
    if let Some(completion) = completion {
        completion();
    }
    result
}
