//! Per-context registry of named task queues.

use crate::queue::TaskQueue;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::{fmt, hash::Hash, sync::Arc};

/// Name of the queue drained on a context's rendering thread each frame.
pub const RENDER: &str = "render";

/// Name of the queue drained during the update phase of the frame.
pub const UPDATE: &str = "update";

/// The named task queues belonging to a single context key.
///
/// Always contains the [`RENDER`] and [`UPDATE`] queues; further queues can
/// be added with [`Self::insert_queue`].
pub struct ContextTaskQueues<C: 'static> {
    queues: RwLock<FxHashMap<String, Arc<TaskQueue<C>>>>,
}

/// Registry of [`ContextTaskQueues`] keyed by an opaque context key.
///
/// This is an explicit service object: create one at engine startup and
/// pass it by reference to whatever needs to defer work to a context's
/// owning thread.
pub struct TaskQueueManager<K, C: 'static> {
    contexts: Mutex<FxHashMap<K, Arc<ContextTaskQueues<C>>>>,
}

impl<C: 'static> ContextTaskQueues<C> {
    fn with_default_queues() -> Self {
        let mut queues = FxHashMap::default();
        queues.insert(RENDER.to_string(), Arc::new(TaskQueue::new()));
        queues.insert(UPDATE.to_string(), Arc::new(TaskQueue::new()));
        Self {
            queues: RwLock::new(queues),
        }
    }

    /// Returns the queue with the given name, if present.
    pub fn queue(&self, name: &str) -> Option<Arc<TaskQueue<C>>> {
        self.queues.read().get(name).cloned()
    }

    /// Returns the render queue.
    pub fn render(&self) -> Arc<TaskQueue<C>> {
        self.queue(RENDER).unwrap()
    }

    /// Returns the update queue.
    pub fn update(&self) -> Arc<TaskQueue<C>> {
        self.queue(UPDATE).unwrap()
    }

    /// Returns the queue with the given name, creating it if absent.
    pub fn insert_queue(&self, name: impl Into<String>) -> Arc<TaskQueue<C>> {
        Arc::clone(
            self.queues
                .write()
                .entry(name.into())
                .or_insert_with(|| Arc::new(TaskQueue::new())),
        )
    }

    /// Returns the names of all queues.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }
}

impl<K, C> TaskQueueManager<K, C>
where
    K: Eq + Hash + Clone,
    C: 'static,
{
    /// Creates a registry with no context entries.
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the queues for the given context key, creating them (with
    /// the default render and update queues) on first access.
    ///
    /// Creation happens under a single lock, so concurrent first accesses
    /// for the same key all observe the same instance.
    pub fn for_context(&self, key: K) -> Arc<ContextTaskQueues<C>> {
        Arc::clone(
            self.contexts
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(ContextTaskQueues::with_default_queues())),
        )
    }

    /// Returns the queues for the given context key without creating them.
    pub fn get(&self, key: &K) -> Option<Arc<ContextTaskQueues<C>>> {
        self.contexts.lock().get(key).cloned()
    }

    /// Removes and returns the queues for the given context key.
    ///
    /// Pending tasks are neither cancelled nor migrated; use
    /// [`Self::migrate_tasks`] first if a surviving context should take
    /// them over.
    pub fn drop_context(&self, key: &K) -> Option<Arc<ContextTaskQueues<C>>> {
        self.contexts.lock().remove(key)
    }

    /// Moves all pending tasks from the source context's queues to the
    /// like-named queues of the destination context, appending at the tail
    /// in order and leaving the source queues empty.
    ///
    /// Does nothing if either context key is unknown, and skips any source
    /// queue whose name does not exist on the destination.
    pub fn migrate_tasks(&self, source: &K, dest: &K) {
        let (source, dest) = {
            let contexts = self.contexts.lock();
            (contexts.get(source).cloned(), contexts.get(dest).cloned())
        };
        let (Some(source), Some(dest)) = (source, dest) else {
            return;
        };

        for name in source.queue_names() {
            let Some(dest_queue) = dest.queue(&name) else {
                continue;
            };
            let source_queue = source.queue(&name).unwrap();
            if !source_queue.is_empty() {
                dest_queue.append_from(&source_queue);
            }
        }
    }

    /// Returns the keys of all registered contexts.
    pub fn context_keys(&self) -> Vec<K> {
        self.contexts.lock().keys().cloned().collect()
    }
}

impl<K, C> Default for TaskQueueManager<K, C>
where
    K: Eq + Hash + Clone,
    C: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> fmt::Debug for ContextTaskQueues<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextTaskQueues")
            .field("queue_names", &self.queue_names())
            .finish_non_exhaustive()
    }
}

impl<K: fmt::Debug + Eq + Hash + Clone, C: 'static> fmt::Debug for TaskQueueManager<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueueManager")
            .field("context_keys", &self.context_keys())
            .finish_non_exhaustive()
    }
}
