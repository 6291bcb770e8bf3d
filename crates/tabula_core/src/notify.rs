//! Table-change notifications.
//!
//! Savers report every write to the coordinator's [`ModelNotifier`]. The
//! default [`DirectModelNotifier`] fans each change out to in-process
//! subscribers and keeps a bounded history for catch-up polling.
//!
//! Writes made inside [`Database::execute_transaction`](crate::Database::execute_transaction)
//! are held back and delivered once the outermost transaction commits; a
//! rollback delivers nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! let notifier = DirectModelNotifier::new();
//! let receiver = notifier.subscribe();
//!
//! std::thread::spawn(move || {
//!     while let Ok(change) = receiver.recv() {
//!         println!("{} {:?}", change.table, change.action);
//!     }
//! });
//! ```

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// What happened to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    /// A row was inserted.
    Insert,
    /// A row was inserted or replaced.
    Save,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// Sink for table-change notifications.
pub trait ModelNotifier: Send + Sync {
    /// Reports that `table` changed.
    fn notify_table_changed(&self, table: &str, action: ChangeAction);
}

/// A delivered change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    /// Delivery sequence, starting at 1.
    pub sequence: u64,
    /// The changed table.
    pub table: String,
    /// What happened.
    pub action: ChangeAction,
}

/// The default notifier: in-process channels, delivery in notification order.
pub struct DirectModelNotifier {
    subscribers: RwLock<Vec<Sender<TableChange>>>,
    history: RwLock<Vec<TableChange>>,
    max_history: usize,
    sequence: AtomicU64,
}

impl DirectModelNotifier {
    /// Creates a notifier keeping the last 1000 changes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(1000)
    }

    /// Creates a notifier with a specific history limit.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
            sequence: AtomicU64::new(0),
        }
    }

    /// Subscribes to every future change.
    pub fn subscribe(&self) -> Receiver<TableChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Returns changes with sequence greater than `cursor`, up to `limit`.
    #[must_use]
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<TableChange> {
        self.history
            .read()
            .iter()
            .filter(|c| c.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the latest delivered sequence, or 0.
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }
}

impl Default for DirectModelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelNotifier for DirectModelNotifier {
    fn notify_table_changed(&self, table: &str, action: ChangeAction) {
        // Sequence and delivery under one lock keep subscribers in order.
        let mut subscribers = self.subscribers.write();
        let change = TableChange {
            sequence: self.sequence.fetch_add(1, Ordering::AcqRel) + 1,
            table: table.to_string(),
            action,
        };

        {
            let mut history = self.history.write();
            history.push(change.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// Changes written inside coordinator transactions, held per thread until
/// the outermost transaction on that thread commits.
#[derive(Debug, Default)]
pub(crate) struct PendingChanges {
    scopes: Mutex<HashMap<ThreadId, Scope>>,
}

#[derive(Debug, Default)]
struct Scope {
    depth: usize,
    changes: Vec<(String, ChangeAction)>,
    /// Set once any level failed; the outermost end then rolls back.
    doomed: bool,
}

impl PendingChanges {
    /// Opens a scope on the calling thread. Scopes nest.
    pub(crate) fn enter(&self) -> ChangeScope<'_> {
        self.scopes
            .lock()
            .entry(thread::current().id())
            .or_default()
            .depth += 1;
        ChangeScope {
            pending: self,
            finished: false,
        }
    }

    /// Buffers a change if the calling thread is inside a scope.
    fn defer(&self, table: &str, action: ChangeAction) -> bool {
        match self.scopes.lock().get_mut(&thread::current().id()) {
            Some(scope) => {
                if !scope.doomed {
                    scope.changes.push((table.to_string(), action));
                }
                true
            }
            None => false,
        }
    }

    fn exit(&self, committed: bool) -> Vec<(String, ChangeAction)> {
        let mut scopes = self.scopes.lock();
        let id = thread::current().id();
        let Some(scope) = scopes.get_mut(&id) else {
            return Vec::new();
        };
        if !committed {
            scope.doomed = true;
            scope.changes.clear();
        }
        scope.depth -= 1;
        if scope.depth > 0 {
            return Vec::new();
        }
        match scopes.remove(&id) {
            Some(scope) if !scope.doomed => scope.changes,
            _ => Vec::new(),
        }
    }
}

/// One transaction level of [`PendingChanges`]. Dropping it unfinished
/// counts as a rollback.
pub(crate) struct ChangeScope<'a> {
    pending: &'a PendingChanges,
    finished: bool,
}

impl ChangeScope<'_> {
    /// Ends the level. Returns the changes to deliver, which is empty unless
    /// this was the outermost level and every level committed.
    pub(crate) fn finish(mut self, committed: bool) -> Vec<(String, ChangeAction)> {
        self.finished = true;
        self.pending.exit(committed)
    }
}

impl Drop for ChangeScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pending.exit(false);
        }
    }
}

/// Routes a saver's notifications through [`PendingChanges`], delivering
/// straight to `target` outside coordinator transactions.
pub(crate) struct DeferredNotifier<'a> {
    pub(crate) pending: &'a PendingChanges,
    pub(crate) target: Arc<dyn ModelNotifier>,
}

impl ModelNotifier for DeferredNotifier<'_> {
    fn notify_table_changed(&self, table: &str, action: ChangeAction) {
        if !self.pending.defer(table, action) {
            self.target.notify_table_changed(table, action);
        }
    }
}

impl std::fmt::Debug for DirectModelNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectModelNotifier")
            .field("subscribers", &self.subscriber_count())
            .field("latest_sequence", &self.latest_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn notify_and_receive() {
        let notifier = DirectModelNotifier::new();
        let rx = notifier.subscribe();

        notifier.notify_table_changed("users", ChangeAction::Insert);

        let change = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(change.sequence, 1);
        assert_eq!(change.table, "users");
        assert_eq!(change.action, ChangeAction::Insert);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = DirectModelNotifier::new();
        let rx = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        drop(rx);
        notifier.notify_table_changed("users", ChangeAction::Delete);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let notifier = DirectModelNotifier::with_max_history(3);
        for _ in 0..5 {
            notifier.notify_table_changed("t", ChangeAction::Save);
        }
        let kept = notifier.poll(0, 10);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].sequence, 3);
        assert_eq!(notifier.latest_sequence(), 5);
    }

    #[test]
    fn concurrent_notifications_arrive_in_sequence() {
        let notifier = Arc::new(DirectModelNotifier::new());
        let rx = notifier.subscribe();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let notifier = Arc::clone(&notifier);
                thread::spawn(move || {
                    for _ in 0..25 {
                        notifier.notify_table_changed("t", ChangeAction::Update);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let sequences: Vec<u64> = rx.try_iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn pending_changes_wait_for_outermost_commit() {
        let pending = PendingChanges::default();
        let outer = pending.enter();
        assert!(pending.defer("a", ChangeAction::Insert));
        let inner = pending.enter();
        assert!(pending.defer("b", ChangeAction::Update));
        assert!(inner.finish(true).is_empty());

        let delivered = outer.finish(true);
        assert_eq!(
            delivered,
            vec![
                ("a".to_string(), ChangeAction::Insert),
                ("b".to_string(), ChangeAction::Update),
            ]
        );
        assert!(!pending.defer("c", ChangeAction::Delete));
    }

    #[test]
    fn failed_level_discards_the_whole_scope() {
        let pending = PendingChanges::default();
        let outer = pending.enter();
        pending.defer("a", ChangeAction::Insert);
        {
            let _inner = pending.enter();
            pending.defer("b", ChangeAction::Insert);
        }
        pending.defer("c", ChangeAction::Insert);
        assert!(outer.finish(true).is_empty());
    }

    #[test]
    fn scopes_are_per_thread() {
        let pending = Arc::new(PendingChanges::default());
        let scope = pending.enter();
        let other = Arc::clone(&pending);
        let buffered = thread::spawn(move || other.defer("t", ChangeAction::Save))
            .join()
            .unwrap();
        assert!(!buffered);
        assert!(scope.finish(true).is_empty());
    }
}
