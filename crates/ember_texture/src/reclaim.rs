//! Reclamation of native texture handles.
//!
//! Handles become eligible for reclamation in two ways: the last clone of
//! a [`Texture`](crate::Texture) is dropped (its handles land on the
//! manager's expired-handle queue), or a sweep explicitly strips handles
//! from live cache entries. Either way, a handle may only be deleted by
//! the thread owning its context, so each sweep deletes the batches owned
//! by the context active on the calling thread directly and defers every
//! other batch onto the owning context's render task queue.

use crate::{
    context::{ContextId, RenderContext, TextureHandle},
    manager::TextureManager,
};
use anyhow::Context as _;
use ember_log::{debug, error, with_trace_logging};
use ember_task::{TaskHandle, TaskQueueManager};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Reports a failed immediate deletion to the caller of a sweep.
pub type DeletionErrorSink<'a> = dyn FnMut(ContextId, anyhow::Error) + 'a;

/// Batches of native handles stripped from dropped textures, awaiting a
/// reclamation sweep.
#[derive(Debug, Default)]
pub struct ExpiredHandleQueue {
    batches: Mutex<Vec<Vec<(ContextId, TextureHandle)>>>,
}

impl ExpiredHandleQueue {
    pub(crate) fn push(&self, handles: Vec<(ContextId, TextureHandle)>) {
        self.batches.lock().push(handles);
    }

    pub(crate) fn drain(&self) -> Vec<Vec<(ContextId, TextureHandle)>> {
        std::mem::take(&mut *self.batches.lock())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

/// Reclaims the handles of every texture dropped since the last sweep.
///
/// Batches owned by `active`'s context are deleted through it immediately,
/// with failures reported to `on_error`. Every other batch is enqueued on
/// the owning context's render queue; the returned handles can be awaited
/// to observe those deferred deletions.
pub fn sweep_expired<C>(
    manager: &TextureManager,
    queues: &TaskQueueManager<ContextId, C>,
    active: Option<&C>,
    on_error: &mut DeletionErrorSink<'_>,
) -> Vec<(ContextId, TaskHandle<()>)>
where
    C: RenderContext + 'static,
{
    let batches = gather_expired_batches(manager);
    with_trace_logging!(
        "Reclaiming handles of dropped textures";
        delete_batches(batches, queues, active, on_error)
    )
}

/// Reclaims every handle the given context holds, for cached and dropped
/// textures alike.
///
/// Used when a context is about to be destroyed. Expired handles of other
/// contexts that happen to be queued are reclaimed along the way.
pub fn sweep_context<C>(
    manager: &TextureManager,
    context: ContextId,
    queues: &TaskQueueManager<ContextId, C>,
    active: Option<&C>,
    on_error: &mut DeletionErrorSink<'_>,
) -> Vec<(ContextId, TaskHandle<()>)>
where
    C: RenderContext + 'static,
{
    let mut batches = gather_expired_batches(manager);
    for key in manager.cached_keys() {
        if let Some(handle) = key.remove_handle(context) {
            batches.entry(context).or_default().push(handle);
        }
    }
    with_trace_logging!(
        "Reclaiming all texture handles of {}", context;
        delete_batches(batches, queues, active, on_error)
    )
}

/// Reclaims every handle in every context, for cached and dropped textures
/// alike.
///
/// Used at engine shutdown. Cache entries stay valid; their textures will
/// simply be re-uploaded on next use.
pub fn sweep_all<C>(
    manager: &TextureManager,
    queues: &TaskQueueManager<ContextId, C>,
    active: Option<&C>,
    on_error: &mut DeletionErrorSink<'_>,
) -> Vec<(ContextId, TaskHandle<()>)>
where
    C: RenderContext + 'static,
{
    let mut batches = gather_expired_batches(manager);
    for key in manager.cached_keys() {
        for (context, handle) in key.take_all_handles() {
            batches.entry(context).or_default().push(handle);
        }
    }
    with_trace_logging!(
        "Reclaiming texture handles in every context";
        delete_batches(batches, queues, active, on_error)
    )
}

/// Drains the expired-handle queue and groups the handles by owning
/// context, so each context gets a single deletion batch.
fn gather_expired_batches(manager: &TextureManager) -> FxHashMap<ContextId, Vec<TextureHandle>> {
    let mut batches: FxHashMap<ContextId, Vec<TextureHandle>> = FxHashMap::default();
    for entry in manager.expired_queue().drain() {
        for (context, handle) in entry {
            batches.entry(context).or_default().push(handle);
        }
    }
    batches
}

fn delete_batches<C>(
    batches: FxHashMap<ContextId, Vec<TextureHandle>>,
    queues: &TaskQueueManager<ContextId, C>,
    active: Option<&C>,
    on_error: &mut DeletionErrorSink<'_>,
) -> Vec<(ContextId, TaskHandle<()>)>
where
    C: RenderContext + 'static,
{
    let active_id = active.map(RenderContext::context_id);
    let mut deferred = Vec::new();

    for (context, ids) in batches {
        if let Some(active) = active
            && active_id == Some(context)
        {
            // `active` is on the calling thread, so this batch can go
            // straight to the driver.
            debug!("deleting {} expired texture handles in {context}", ids.len());
            if let Err(err) = active.delete_texture_ids(&ids) {
                error!("failed to delete texture handles in {context}: {err:#}");
                on_error(context, err);
            }
        } else {
            debug!(
                "deferring deletion of {} expired texture handles to {context}",
                ids.len()
            );
            let handle = queues.for_context(context).render().enqueue(move |ctx: Option<&C>| {
                let ctx =
                    ctx.context("no active context supplied to deferred texture deletion")?;
                ctx.delete_texture_ids(&ids)
            });
            deferred.push((context, handle));
        }
    }
    deferred
}
