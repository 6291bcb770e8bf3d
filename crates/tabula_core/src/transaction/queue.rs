//! Single-writer queue for asynchronous transactions.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A unit of queued work.
pub struct QueuedTransaction {
    name: Option<String>,
    job: Box<dyn FnOnce() + Send>,
}

impl QueuedTransaction {
    /// Wraps a job, optionally named for cancellation.
    pub fn new(name: Option<String>, job: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name,
            job: Box::new(job),
        }
    }

    /// Returns the job's name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl std::fmt::Debug for QueuedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTransaction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct State {
    pending: VecDeque<QueuedTransaction>,
    stopped: bool,
    /// Set while the worker is executing a job.
    busy: bool,
    /// Bumped per spawned worker; a worker whose epoch is stale exits.
    epoch: u64,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
    idle: Condvar,
}

/// A FIFO queue drained by one dedicated background thread.
///
/// Jobs run strictly one at a time in submission order. Stopping the queue
/// rejects new jobs and abandons jobs that have not started; a job already
/// running finishes first.
pub struct TransactionQueue {
    name: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionQueue {
    /// Creates an idle queue. The worker thread starts on first use.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                ready: Condvar::new(),
                idle: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker thread if it is not running.
    ///
    /// Also re-opens a stopped queue.
    pub fn start(&self) -> CoreResult<()> {
        let mut worker = self.worker.lock();
        let epoch = {
            let mut state = self.shared.state.lock();
            state.stopped = false;
            if worker.as_ref().is_some_and(|w| !w.is_finished()) {
                return Ok(());
            }
            state.epoch += 1;
            state.epoch
        };

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || drain(&shared, epoch))?;
        debug!(queue = %self.name, "transaction queue started");
        *worker = Some(handle);
        Ok(())
    }

    /// Enqueues a job, starting the worker if needed.
    ///
    /// # Errors
    ///
    /// [`CoreError::QueueStopped`] once the queue has been stopped.
    pub fn add(&self, transaction: QueuedTransaction) -> CoreResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return Err(CoreError::QueueStopped);
            }
            state.pending.push_back(transaction);
        }
        self.shared.ready.notify_one();

        if self.worker.lock().is_none() {
            self.start()?;
        }
        Ok(())
    }

    /// Removes pending jobs with the given name. Returns how many were removed.
    pub fn cancel(&self, name: &str) -> usize {
        let mut state = self.shared.state.lock();
        let before = state.pending.len();
        state.pending.retain(|t| t.name() != Some(name));
        before - state.pending.len()
    }

    /// Stops the queue.
    ///
    /// Pending jobs are dropped unrun. Waits for a running job to finish
    /// unless called from that job.
    pub fn stop(&self) {
        let abandoned = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            let abandoned = state.pending.len();
            state.pending.clear();
            abandoned
        };
        self.shared.ready.notify_all();

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!(queue = %self.name, abandoned, "transaction queue stopped from its own worker");
            return;
        }
        if handle.join().is_err() {
            error!(queue = %self.name, "transaction queue worker panicked");
        }
        debug!(queue = %self.name, abandoned, "transaction queue stopped");
    }

    /// Blocks until no job is pending or running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.pending.is_empty() || state.busy {
            if state.stopped {
                return;
            }
            self.shared.idle.wait(&mut state);
        }
    }

    /// Returns the number of jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Returns true once stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }
}

impl Drop for TransactionQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn drain(shared: &Shared, epoch: u64) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.epoch != epoch {
                    return;
                }
                if state.stopped {
                    state.busy = false;
                    shared.idle.notify_all();
                    return;
                }
                if let Some(job) = state.pending.pop_front() {
                    state.busy = true;
                    break job;
                }
                state.busy = false;
                shared.idle.notify_all();
                shared.ready.wait(&mut state);
            }
        };

        let name = job.name.clone();
        if catch_unwind(AssertUnwindSafe(job.job)).is_err() {
            error!(transaction = ?name, "queued transaction panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_in_submission_order() {
        let queue = TransactionQueue::new("test-queue");
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            queue
                .add(QueuedTransaction::new(None, move || tx.send(i).unwrap()))
                .unwrap();
        }
        queue.wait_idle();
        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn stop_rejects_and_abandons() {
        let queue = TransactionQueue::new("test-queue");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (ran_tx, ran_rx) = mpsc::channel();

        queue
            .add(QueuedTransaction::new(None, move || {
                gate_rx.recv().unwrap();
            }))
            .unwrap();
        let ran = ran_tx.clone();
        queue
            .add(QueuedTransaction::new(None, move || ran.send("late").unwrap()))
            .unwrap();

        // Let the first job start, then stop while it blocks.
        thread::sleep(Duration::from_millis(20));
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gate_tx.send(()).unwrap();
        });
        queue.stop();
        releaser.join().unwrap();

        assert!(ran_rx.try_recv().is_err());
        assert!(matches!(
            queue.add(QueuedTransaction::new(None, || {})),
            Err(CoreError::QueueStopped)
        ));
    }

    #[test]
    fn cancel_by_name() {
        let queue = TransactionQueue::new("test-queue");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue
            .add(QueuedTransaction::new(None, move || {
                gate_rx.recv().unwrap();
            }))
            .unwrap();
        queue
            .add(QueuedTransaction::new(Some("sync".into()), || {}))
            .unwrap();
        queue
            .add(QueuedTransaction::new(Some("sync".into()), || {}))
            .unwrap();
        queue
            .add(QueuedTransaction::new(Some("other".into()), || {}))
            .unwrap();

        assert_eq!(queue.cancel("sync"), 2);
        assert_eq!(queue.cancel("sync"), 0);
        gate_tx.send(()).unwrap();
        queue.wait_idle();
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let queue = TransactionQueue::new("test-queue");
        let (tx, rx) = mpsc::channel();
        queue
            .add(QueuedTransaction::new(None, || panic!("boom")))
            .unwrap();
        queue
            .add(QueuedTransaction::new(None, move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn restart_from_own_worker_keeps_one_drainer() {
        let queue = Arc::new(TransactionQueue::new("test-queue"));
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&queue);
        let first = tx.clone();
        queue
            .add(QueuedTransaction::new(None, move || {
                inner.stop();
                inner.start().unwrap();
                for i in 1..=20 {
                    let tx = first.clone();
                    inner
                        .add(QueuedTransaction::new(None, move || tx.send(i).unwrap()))
                        .unwrap();
                }
                thread::sleep(Duration::from_millis(20));
            }))
            .unwrap();

        let order: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn restart_after_stop() {
        let queue = TransactionQueue::new("test-queue");
        queue.stop();
        assert!(queue.is_stopped());
        queue.start().unwrap();

        let (tx, rx) = mpsc::channel();
        queue
            .add(QueuedTransaction::new(None, move || tx.send(7).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }
}
