//! Ordered queues of deferred tasks executed on the calling thread.

use crate::task::{self, RawTask, RunOutcome, TaskHandle};
use anyhow::Result;
use ember_log::error;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

/// How many tasks a single [`TaskQueue::execute`] call may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionBudget {
    /// At most one (non-cancelled) task per call. The default.
    Single,
    /// Every task queued at the time of the call.
    Unbounded,
    /// Keep starting tasks until the given amount of time has elapsed. A
    /// task that is already running when the budget runs out is allowed to
    /// finish; remaining tasks stay queued for a later call.
    TimeLimited(Duration),
}

type ErrorListener = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

/// An ordered, thread-safe queue of deferred tasks.
///
/// Tasks are appended at the tail and executed in FIFO order, skipping any
/// task that was cancelled while queued. Execution happens synchronously on
/// the thread calling [`Self::execute`]; the queue never runs anything on
/// its own. This is what lets callers confine work to the thread owning a
/// particular rendering context.
///
/// `C` is the execution context type passed by reference to each task when
/// `execute` is invoked with one (e.g. the active render context).
pub struct TaskQueue<C: 'static> {
    tasks: Mutex<VecDeque<RawTask<C>>>,
    budget: Mutex<ExecutionBudget>,
    error_listeners: RwLock<Vec<ErrorListener>>,
}

impl<C: 'static> TaskQueue<C> {
    /// Creates a new empty queue with a [`ExecutionBudget::Single`] budget.
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            budget: Mutex::new(ExecutionBudget::Single),
            error_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Returns the number of queued tasks (including cancelled ones that
    /// have not been skipped over yet).
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Returns the current execution budget.
    pub fn execution_budget(&self) -> ExecutionBudget {
        *self.budget.lock()
    }

    /// Sets the execution budget applied by subsequent [`Self::execute`]
    /// calls.
    pub fn set_execution_budget(&self, budget: ExecutionBudget) {
        *self.budget.lock() = budget;
    }

    /// Registers a listener invoked with the error of every task that fails
    /// during execution.
    ///
    /// This is the mechanism for observing failures of tasks nobody awaits,
    /// like deferred resource deletions.
    pub fn add_error_listener(&self, listener: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        self.error_listeners.write().push(Box::new(listener));
    }

    /// Appends the given task to the tail of the queue and returns a handle
    /// for cancelling or awaiting it.
    ///
    /// The task receives the execution context reference that is passed to
    /// the `execute` call that ends up running it.
    pub fn enqueue<T, F>(&self, task_fn: F) -> TaskHandle<T>
    where
        F: FnOnce(Option<&C>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (raw, handle) = task::create_task(task_fn);
        self.tasks.lock().push_back(raw);
        handle
    }

    /// Executes queued tasks on the calling thread.
    ///
    /// Tasks run in submission order; cancelled tasks are skipped without
    /// consuming any budget. A task failure is captured, reported to the
    /// registered error listeners and logged, and never interrupts the
    /// loop. How many tasks run is governed by the configured
    /// [`ExecutionBudget`].
    pub fn execute(&self, context: Option<&C>) {
        let begin = Instant::now();
        let budget = self.execution_budget();

        loop {
            let Some(task) = self.tasks.lock().pop_front() else {
                return;
            };

            // The task runs without the queue lock held, so tasks may
            // enqueue further tasks.
            match task.run(context) {
                RunOutcome::Skipped => {
                    continue;
                }
                RunOutcome::Succeeded => {}
                RunOutcome::Failed(error) => {
                    error!("Deferred task failed: {error:#}");
                    for listener in self.error_listeners.read().iter() {
                        listener(&error);
                    }
                }
            }

            match budget {
                ExecutionBudget::Single => return,
                ExecutionBudget::Unbounded => {}
                ExecutionBudget::TimeLimited(limit) => {
                    if begin.elapsed() >= limit {
                        return;
                    }
                }
            }
        }
    }

    /// Removes all queued tasks without running them, cancelling each one
    /// so that waiters are released.
    pub fn clear(&self) {
        let removed: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &removed {
            task.cancel();
        }
    }

    /// Moves every task queued on `other` to the tail of this queue,
    /// preserving their order.
    pub fn append_from(&self, other: &TaskQueue<C>) {
        // Drain fully before touching our own lock so the two queue locks
        // are never held at once.
        let moved: Vec<_> = other.tasks.lock().drain(..).collect();
        if !moved.is_empty() {
            self.tasks.lock().extend(moved);
        }
    }
}

impl<C: 'static> Default for TaskQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> fmt::Debug for TaskQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("budget", &self.execution_budget())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskError, TaskState};
    use anyhow::anyhow;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn order_recorder() -> (
        Arc<Mutex<Vec<&'static str>>>,
        impl Fn(&'static str) + Clone + Send + 'static,
    ) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let order = Arc::clone(&order);
            move |name| order.lock().push(name)
        };
        (order, recorder)
    }

    #[test]
    fn executing_empty_queue_does_nothing() {
        let queue: TaskQueue<()> = TaskQueue::new();
        queue.execute(None);
        assert!(queue.is_empty());
    }

    #[test]
    fn default_budget_executes_one_task_per_call() {
        let queue: TaskQueue<()> = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            queue.enqueue(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        queue.execute(None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 2);

        queue.execute(None);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unbounded_budget_drains_queue_in_fifo_order() {
        let queue: TaskQueue<()> = TaskQueue::new();
        queue.set_execution_budget(ExecutionBudget::Unbounded);
        let (order, record) = order_recorder();

        for name in ["a", "b", "c"] {
            let record = record.clone();
            queue.enqueue(move |_| {
                record(name);
                Ok(())
            });
        }

        queue.execute(None);

        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancelled_task_is_skipped_and_never_runs() {
        let queue: TaskQueue<()> = TaskQueue::new();
        queue.set_execution_budget(ExecutionBudget::Unbounded);
        let (order, record) = order_recorder();

        let record_a = record.clone();
        let a = queue.enqueue(move |_| {
            record_a("a");
            Ok(())
        });
        let record_b = record.clone();
        let b = queue.enqueue(move |_| {
            record_b("b");
            Ok(())
        });
        let record_c = record.clone();
        let c = queue.enqueue(move |_| {
            record_c("c");
            Ok(())
        });

        assert!(b.cancel());
        queue.execute(None);

        assert_eq!(*order.lock(), vec!["a", "c"]);
        assert_eq!(b.state(), TaskState::Cancelled);
        assert_eq!(a.state(), TaskState::Succeeded);
        assert_eq!(c.state(), TaskState::Succeeded);
    }

    #[test]
    fn single_budget_skips_cancelled_tasks_without_consuming_the_budget() {
        let queue: TaskQueue<()> = TaskQueue::new();
        let (order, record) = order_recorder();

        let cancelled = queue.enqueue(|_| Ok(()));
        let record_b = record.clone();
        queue.enqueue(move |_| {
            record_b("b");
            Ok(())
        });

        cancelled.cancel();
        queue.execute(None);

        // The cancelled head did not count as this call's single task.
        assert_eq!(*order.lock(), vec!["b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn time_limited_budget_leaves_remaining_tasks_queued() {
        let queue: TaskQueue<()> = TaskQueue::new();
        queue.set_execution_budget(ExecutionBudget::TimeLimited(Duration::from_millis(30)));

        for _ in 0..4 {
            queue.enqueue(|_| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(())
            });
        }

        queue.execute(None);

        // After at most two 20 ms tasks the 30 ms budget is exhausted, so
        // at least two tasks must remain for a later call.
        assert!(queue.len() >= 2);
        assert!(queue.len() < 4);
    }

    #[test]
    fn task_failure_is_reported_to_listeners_and_waiters() {
        let queue: TaskQueue<()> = TaskQueue::new();
        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let observed = Arc::clone(&observed);
            queue.add_error_listener(move |error| {
                observed.lock().push(error.to_string());
            });
        }

        let handle = queue.enqueue::<(), _>(|_| Err(anyhow!("delete failed")));
        queue.execute(None);

        assert_eq!(*observed.lock(), vec!["delete failed".to_string()]);
        assert!(matches!(handle.wait(), Err(TaskError::Failed(_))));
    }

    #[test]
    fn failing_task_does_not_halt_subsequent_tasks() {
        let queue: TaskQueue<()> = TaskQueue::new();
        queue.set_execution_budget(ExecutionBudget::Unbounded);
        let ran_second = Arc::new(AtomicUsize::new(0));

        queue.enqueue::<(), _>(|_| Err(anyhow!("boom")));
        {
            let ran_second = Arc::clone(&ran_second);
            queue.enqueue(move |_| {
                ran_second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        queue.execute(None);

        assert_eq!(ran_second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn execution_context_is_handed_to_each_task() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        let handle = queue.enqueue(|ctx: Option<&u32>| Ok(ctx.copied()));

        queue.execute(Some(&99));

        assert_eq!(handle.wait().unwrap(), Some(99));
    }

    #[test]
    fn clearing_queue_cancels_pending_tasks() {
        let queue: TaskQueue<()> = TaskQueue::new();
        let handle = queue.enqueue(|_| Ok(()));

        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(matches!(handle.wait(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn appending_moves_tasks_to_tail_preserving_order() {
        let dest: TaskQueue<()> = TaskQueue::new();
        let source: TaskQueue<()> = TaskQueue::new();
        dest.set_execution_budget(ExecutionBudget::Unbounded);
        let (order, record) = order_recorder();

        let record_a = record.clone();
        dest.enqueue(move |_| {
            record_a("dest-a");
            Ok(())
        });
        for name in ["src-a", "src-b"] {
            let record = record.clone();
            source.enqueue(move |_| {
                record(name);
                Ok(())
            });
        }

        dest.append_from(&source);

        assert!(source.is_empty());
        assert_eq!(dest.len(), 3);

        dest.execute(None);
        assert_eq!(*order.lock(), vec!["dest-a", "src-a", "src-b"]);
    }

    #[test]
    fn tasks_enqueued_from_other_threads_all_execute() {
        let queue: Arc<TaskQueue<()>> = Arc::new(TaskQueue::new());
        queue.set_execution_budget(ExecutionBudget::Unbounded);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    queue.enqueue(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        queue.execute(None);

        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
