//! Identity of native rendering contexts.

use anyhow::Result;
use std::{fmt, num::NonZeroU32};

/// A native texture handle as issued by the underlying graphics API.
///
/// The underlying API reserves 0 to mean "no texture", so a handle is
/// non-zero by construction and "no handle for this context" is expressed
/// as [`None`].
pub type TextureHandle = NonZeroU32;

/// Opaque, equality-comparable identity of a native rendering context.
///
/// Used both as the key of a texture's per-context handle table and as the
/// lookup key of the per-context task queue registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

impl From<u64> for ContextId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A native rendering context as seen by this crate: an identity plus the
/// ability to delete a batch of native texture handles.
///
/// `delete_texture_ids` must only be called from the thread that currently
/// owns the context. The reclamation sweeps uphold this by deleting
/// directly only through the context active on the sweeping thread and
/// deferring every other batch onto the owning context's render queue.
pub trait RenderContext {
    /// Returns the identity of this context.
    fn context_id(&self) -> ContextId;

    /// Deletes the given batch of native texture handles.
    ///
    /// A failure to delete one handle should not prevent deletion of the
    /// remaining handles in the batch.
    ///
    /// # Errors
    /// Returns an error if any of the handles could not be deleted.
    fn delete_texture_ids(&self, ids: &[TextureHandle]) -> Result<()>;
}
