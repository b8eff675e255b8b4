//! Deferred, cancellable units of work that must run on a specific thread.
//!
//! A [`TaskQueue`] never spawns threads of its own: tasks execute
//! synchronously inside [`TaskQueue::execute`], which the owning thread
//! (typically the one holding a rendering context) calls at a controlled
//! point in its frame. The [`TaskQueueManager`] keys a set of named queues
//! by an opaque context key so that work destined for a particular context
//! always ends up on that context's queues.

pub mod queue;
pub mod registry;
pub mod task;

pub use queue::{ExecutionBudget, TaskQueue};
pub use registry::{ContextTaskQueues, RENDER, TaskQueueManager, UPDATE};
pub use task::{TaskError, TaskHandle, TaskState};
