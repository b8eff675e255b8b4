//! The deferred task unit and its awaitable handle.

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

/// The lifecycle state of a task unit.
///
/// A task starts out `Pending`. From there it either becomes `Cancelled`
/// (before it ever runs) or `Running`, and a running task finishes as
/// `Succeeded` or `Failed`. No other transitions exist, and a task leaves
/// `Pending` at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Cancelled,
    Running,
    Succeeded,
    Failed,
}

/// Why awaiting a task did not produce its value.
#[derive(Clone, Debug)]
pub enum TaskError {
    /// The task was cancelled before it ran.
    Cancelled,
    /// The timeout elapsed while the task was still pending or running.
    TimedOut,
    /// The task ran and failed with the contained error.
    ///
    /// The error is shared because queue error listeners observe the same
    /// instance.
    Failed(Arc<anyhow::Error>),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "task was cancelled before execution"),
            Self::TimedOut => write!(f, "timed out waiting for task"),
            Self::Failed(error) => write!(f, "task failed: {error:#}"),
        }
    }
}

impl std::error::Error for TaskError {}

/// A handle to a task submitted to a [`TaskQueue`](crate::TaskQueue).
///
/// The handle can be used to cancel the task while it is still pending and
/// to block until the task has finished.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    inner: Mutex<SharedInner<T>>,
    completed: Condvar,
}

struct SharedInner<T> {
    state: TaskState,
    outcome: Option<Result<T, Arc<anyhow::Error>>>,
}

/// Queue-internal view of a task: cancellation without knowledge of the
/// output type.
pub(crate) trait Cancellable: Send + Sync {
    /// Transitions the task from `Pending` to `Cancelled` if possible.
    fn cancel_if_pending(&self) -> bool;
}

/// A type-erased task unit as stored in a queue.
///
/// `C` is the execution context type handed to the closure when the queue
/// is executed with one.
pub(crate) struct RawTask<C: 'static> {
    run: Box<dyn FnOnce(Option<&C>) -> RunOutcome + Send>,
    shared: Arc<dyn Cancellable>,
}

/// What happened when a queued task was driven.
pub(crate) enum RunOutcome {
    /// The task had been cancelled while queued and was not run.
    Skipped,
    Succeeded,
    Failed(Arc<anyhow::Error>),
}

/// Creates the queue-side and caller-side halves of a task unit.
pub(crate) fn create_task<C, T, F>(task_fn: F) -> (RawTask<C>, TaskHandle<T>)
where
    C: 'static,
    F: FnOnce(Option<&C>) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let shared = Arc::new(Shared {
        inner: Mutex::new(SharedInner {
            state: TaskState::Pending,
            outcome: None,
        }),
        completed: Condvar::new(),
    });

    let run_shared = Arc::clone(&shared);
    let run = Box::new(move |context: Option<&C>| {
        if !run_shared.begin() {
            return RunOutcome::Skipped;
        }
        match task_fn(context) {
            Ok(value) => {
                run_shared.finish(Ok(value));
                RunOutcome::Succeeded
            }
            Err(error) => {
                let error = Arc::new(error);
                run_shared.finish(Err(Arc::clone(&error)));
                RunOutcome::Failed(error)
            }
        }
    });

    let handle = TaskHandle {
        shared: Arc::clone(&shared),
    };
    (
        RawTask {
            run,
            shared: shared as Arc<dyn Cancellable>,
        },
        handle,
    )
}

impl<T> Shared<T> {
    /// Transitions `Pending -> Running`. Returns whether the task should
    /// actually run.
    fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            TaskState::Pending => {
                inner.state = TaskState::Running;
                true
            }
            TaskState::Cancelled => false,
            // A task is popped from its queue exactly once.
            state => unreachable!("task started while in state {state:?}"),
        }
    }

    fn finish(&self, outcome: Result<T, Arc<anyhow::Error>>) {
        let mut inner = self.inner.lock();
        inner.state = if outcome.is_ok() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        inner.outcome = Some(outcome);
        self.completed.notify_all();
    }
}

impl<T: Send> Cancellable for Shared<T> {
    fn cancel_if_pending(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Pending {
            inner.state = TaskState::Cancelled;
            self.completed.notify_all();
            true
        } else {
            false
        }
    }
}

impl<C: 'static> RawTask<C> {
    pub(crate) fn run(self, context: Option<&C>) -> RunOutcome {
        (self.run)(context)
    }

    pub(crate) fn cancel(&self) -> bool {
        self.shared.cancel_if_pending()
    }
}

impl<T: Send> TaskHandle<T> {
    /// Returns the current state of the task.
    pub fn state(&self) -> TaskState {
        self.shared.inner.lock().state
    }

    /// Cancels the task if it has not started running.
    ///
    /// Returns `true` if the task was still pending and is now cancelled.
    /// Once the task is running or finished, cancellation requests are
    /// ignored and `false` is returned.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_if_pending()
    }

    /// Blocks the calling thread until the task has finished, returning its
    /// output.
    ///
    /// # Errors
    /// Returns an error if the task was cancelled before it ran or if it
    /// failed.
    pub fn wait(self) -> Result<T, TaskError> {
        self.wait_until(None)
    }

    /// Blocks like [`Self::wait`], but gives up once the timeout elapses.
    ///
    /// # Errors
    /// Returns [`TaskError::TimedOut`] if the task is still pending or
    /// running when the timeout elapses; this is distinct from the task
    /// itself failing.
    pub fn wait_for(self, timeout: Duration) -> Result<T, TaskError> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(self, deadline: Option<Instant>) -> Result<T, TaskError> {
        let mut inner = self.shared.inner.lock();
        loop {
            match inner.state {
                TaskState::Pending | TaskState::Running => {}
                TaskState::Cancelled => return Err(TaskError::Cancelled),
                TaskState::Succeeded | TaskState::Failed => {
                    // The handle is consumed, so the outcome is present.
                    return match inner.outcome.take().unwrap() {
                        Ok(value) => Ok(value),
                        Err(error) => Err(TaskError::Failed(error)),
                    };
                }
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TaskError::TimedOut);
                    }
                    self.shared.completed.wait_for(&mut inner, deadline - now);
                }
                None => {
                    self.shared.completed.wait(&mut inner);
                }
            }
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.shared.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl<C: 'static> fmt::Debug for RawTask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask").finish_non_exhaustive()
    }
}
