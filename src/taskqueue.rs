//! Readiness queue for work submitted before a database can serve it.

use parking_lot::Mutex;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    ready: bool,
    pending: Vec<Task>,
}

/// Holds tasks until the owner signals readiness, then runs them in
/// submission order. Tasks submitted after readiness run immediately on the
/// submitting thread.
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(ready: bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready,
                pending: Vec::new(),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Run `task` now if ready, otherwise queue it.
    pub fn add_task(&self, task: Task) {
        {
            let mut state = self.state.lock();
            if !state.ready {
                state.pending.push(task);
                return;
            }
        }
        task();
    }

    /// Mark the queue ready and drain pending tasks on the calling thread.
    pub fn mark_ready(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.ready = true;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            tracing::debug!(tasks = pending.len(), "running queued tasks");
        }
        for task in pending {
            task();
        }
    }

    /// Drop every pending task without running it.
    pub fn clear(&self) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending);
        pending.len()
    }

    /// Number of tasks waiting for readiness.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ready_queue_runs_immediately() {
        let queue = TaskQueue::new(true);
        let ran = Arc::new(Mutex::new(false));

        let flag = Arc::clone(&ran);
        queue.add_task(Box::new(move || *flag.lock() = true));

        assert!(*ran.lock());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_tasks_deferred_until_ready() {
        let queue = TaskQueue::new(false);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.add_task(Box::new(move || order.lock().push(i)));
        }
        assert_eq!(queue.pending(), 3);
        assert!(order.lock().is_empty());

        queue.mark_ready();
        assert!(queue.is_ready());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
    }
}
