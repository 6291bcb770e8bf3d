//! Transaction coordination.
//!
//! Two execution modes share the coordinator's handle:
//! - **Synchronous**: [`Database::execute_transaction`](crate::Database::execute_transaction)
//!   runs on the calling thread inside a [`TransactionGuard`]
//! - **Asynchronous**: [`Database::begin_transaction_async`](crate::Database::begin_transaction_async)
//!   queues work on a single background thread, in submission order
//!
//! The two modes are not ordered relative to each other.

mod builder;
mod guard;
mod manager;
mod queue;

pub use builder::{AsyncTransaction, TransactionBuilder, TransactionHandle};
pub use guard::TransactionGuard;
pub use manager::{
    DefaultTransactionManager, DefaultTransactionManagerFactory, TransactionManager,
    TransactionManagerFactory,
};
pub use queue::{QueuedTransaction, TransactionQueue};
