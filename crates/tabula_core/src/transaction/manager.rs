//! Transaction managers.

use super::queue::{QueuedTransaction, TransactionQueue};
use crate::error::CoreResult;
use std::sync::Arc;

/// Owns the asynchronous transaction queue of one database.
pub trait TransactionManager: Send + Sync {
    /// Enqueues a transaction.
    fn add_transaction(&self, transaction: QueuedTransaction) -> CoreResult<()>;

    /// Removes queued transactions with the given name.
    fn cancel_by_name(&self, name: &str) -> usize;

    /// Starts (or restarts) the queue.
    fn start_queue(&self) -> CoreResult<()>;

    /// Stops the queue. No queued work starts afterwards.
    fn stop_queue(&self);

    /// Blocks until queued work has drained.
    fn wait_idle(&self) {}
}

/// Builds the transaction manager when configuration is applied.
pub trait TransactionManagerFactory: Send + Sync {
    /// Creates a manager for the named database.
    fn create_manager(&self, database_name: &str) -> Arc<dyn TransactionManager>;
}

/// The stock manager: one [`TransactionQueue`] per database.
#[derive(Debug)]
pub struct DefaultTransactionManager {
    queue: TransactionQueue,
}

impl DefaultTransactionManager {
    /// Creates a manager whose worker thread is named after the database.
    pub fn new(database_name: &str) -> Self {
        Self {
            queue: TransactionQueue::new(format!("tabula-txn-{database_name}")),
        }
    }

    /// Returns the underlying queue.
    #[must_use]
    pub fn queue(&self) -> &TransactionQueue {
        &self.queue
    }
}

impl TransactionManager for DefaultTransactionManager {
    fn add_transaction(&self, transaction: QueuedTransaction) -> CoreResult<()> {
        self.queue.add(transaction)
    }

    fn cancel_by_name(&self, name: &str) -> usize {
        self.queue.cancel(name)
    }

    fn start_queue(&self) -> CoreResult<()> {
        self.queue.start()
    }

    fn stop_queue(&self) {
        self.queue.stop();
    }

    fn wait_idle(&self) {
        self.queue.wait_idle();
    }
}

/// Factory for [`DefaultTransactionManager`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransactionManagerFactory;

impl TransactionManagerFactory for DefaultTransactionManagerFactory {
    fn create_manager(&self, database_name: &str) -> Arc<dyn TransactionManager> {
        Arc::new(DefaultTransactionManager::new(database_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn default_manager_round_trip() {
        let manager = DefaultTransactionManagerFactory.create_manager("app");
        manager.start_queue().unwrap();

        let (tx, rx) = mpsc::channel();
        manager
            .add_transaction(QueuedTransaction::new(None, move || tx.send(1).unwrap()))
            .unwrap();
        manager.wait_idle();
        assert_eq!(rx.try_recv().unwrap(), 1);

        manager.stop_queue();
        assert!(manager
            .add_transaction(QueuedTransaction::new(None, || {}))
            .is_err());
    }
}
