//! Handoff of listener calls into the host's execution context.
//!
//! Platform notifications arrive on threads the host does not own. Listener
//! invocations are wrapped into tasks and posted to a [`HostContext`]; the
//! host decides where they run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Unit of work posted to the host.
pub type Task = Box<dyn FnOnce() + Send>;

/// Where listener calls execute.
pub trait HostContext: Send + Sync {
    fn post(&self, task: Task);
}

/// Runs every task immediately on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl HostContext for InlineContext {
    fn post(&self, task: Task) {
        task();
    }
}

/// Queues tasks until the host drains them from its own thread.
pub struct QueuedContext {
    sender: Mutex<Sender<Task>>,
    receiver: Mutex<Receiver<Task>>,
    depth: AtomicUsize,
}

impl QueuedContext {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel();
        Arc::new(Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
        })
    }

    /// Run every task queued so far on the calling thread.
    ///
    /// Tasks posted while draining run in the next call. Returns the number of
    /// tasks executed.
    pub fn run_pending(&self) -> usize {
        let tasks: Vec<Task> = {
            // Hold the sender so depth and queue contents move together
            let _sender = self.sender.lock();
            let receiver = self.receiver.lock();
            let tasks: Vec<Task> = receiver.try_iter().collect();
            self.depth.fetch_sub(tasks.len(), Ordering::AcqRel);
            tasks
        };
        let count = tasks.len();
        for task in tasks {
            task();
        }
        if count > 0 {
            trace!(count, "Drained host tasks");
        }
        count
    }

    /// Number of tasks waiting to be drained.
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl HostContext for QueuedContext {
    fn post(&self, task: Task) {
        // The receiver lives as long as self, so send cannot fail
        let sender = self.sender.lock();
        if sender.send(task).is_ok() {
            self.depth.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_inline_runs_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        InlineContext.post(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_defers_until_drained() {
        let context = QueuedContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            context.post(Box::new(move || order.lock().push(i)));
        }
        assert!(order.lock().is_empty());
        assert_eq!(context.pending(), 3);

        assert_eq!(context.run_pending(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(context.pending(), 0);
        assert_eq!(context.run_pending(), 0);
    }

    #[test]
    fn test_queued_accepts_posts_from_other_threads() {
        let context = QueuedContext::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let context = Arc::clone(&context);
                let hits = Arc::clone(&hits);
                thread::spawn(move || {
                    context.post(Box::new(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(context.run_pending(), 4);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
