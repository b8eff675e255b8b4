//! Texture identity and per-context native handle tracking.

use crate::context::{ContextId, TextureHandle};
use ember_log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

/// Where the pixel data of a texture comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureSource {
    /// A file on disk.
    Path(PathBuf),
    /// A named resource resolved by the [`ImageLoader`](crate::ImageLoader)
    /// in use.
    Named(String),
}

/// How texture data should be stored on the GPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureStoreFormat {
    /// Pick a suitable format for the image data, preferring compressed
    /// formats when available.
    #[default]
    GuessCompressed,
    /// Pick a suitable uncompressed format for the image data.
    GuessUncompressed,
    Rgba8,
    Luma8,
}

/// How a texture is sampled when it covers fewer screen pixels than texels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MinificationFilter {
    Nearest,
    Bilinear,
    #[default]
    Trilinear,
}

/// The canonical identity of a texture, plus its per-context native handle
/// table.
///
/// Two keys are equal exactly when their identity fields (source, flip
/// flag, store format, minification filter and extra identifier) are
/// equal. The handle table and freshness flags are runtime state and do
/// not participate in equality or hashing, so a key keeps its cache
/// identity while handles come and go.
///
/// Keys are canonicalized through a [`KeyInterner`] so that equal
/// identities share a single instance and thus a single handle table.
#[derive(Debug)]
pub struct TextureKey {
    source: Option<TextureSource>,
    flipped: bool,
    store_format: TextureStoreFormat,
    min_filter: MinificationFilter,
    id: Option<String>,
    code: OnceLock<u64>,
    handles: Mutex<Vec<(ContextId, TextureHandle)>>,
    dirty: Mutex<Vec<ContextId>>,
    users: AtomicUsize,
}

impl TextureKey {
    fn new(
        source: Option<TextureSource>,
        flipped: bool,
        store_format: TextureStoreFormat,
        min_filter: MinificationFilter,
        id: Option<String>,
    ) -> Self {
        Self {
            source,
            flipped,
            store_format,
            min_filter,
            id,
            code: OnceLock::new(),
            handles: Mutex::new(Vec::new()),
            dirty: Mutex::new(Vec::new()),
            users: AtomicUsize::new(0),
        }
    }

    pub fn source(&self) -> Option<&TextureSource> {
        self.source.as_ref()
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    pub fn store_format(&self) -> TextureStoreFormat {
        self.store_format
    }

    pub fn min_filter(&self) -> MinificationFilter {
        self.min_filter
    }

    /// The extra identifier distinguishing keys with the same source, if
    /// any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The memoized hash over the identity fields.
    fn code(&self) -> u64 {
        *self.code.get_or_init(|| {
            let mut hasher = FxHasher::default();
            self.source.hash(&mut hasher);
            self.flipped.hash(&mut hasher);
            self.store_format.hash(&mut hasher);
            self.min_filter.hash(&mut hasher);
            self.id.hash(&mut hasher);
            hasher.finish()
        })
    }

    /// Records the native handle this texture has in the given context,
    /// returning the handle it replaced, if any.
    pub fn set_handle(&self, context: ContextId, handle: TextureHandle) -> Option<TextureHandle> {
        let mut handles = self.handles.lock();
        match handles.iter_mut().find(|(ctx, _)| *ctx == context) {
            Some((_, existing)) => Some(std::mem::replace(existing, handle)),
            None => {
                handles.push((context, handle));
                None
            }
        }
    }

    /// The native handle this texture has in the given context, if any.
    pub fn handle_for_context(&self, context: ContextId) -> Option<TextureHandle> {
        self.handles
            .lock()
            .iter()
            .find(|(ctx, _)| *ctx == context)
            .map(|&(_, handle)| handle)
    }

    /// Removes and returns the native handle recorded for the given
    /// context.
    pub fn remove_handle(&self, context: ContextId) -> Option<TextureHandle> {
        let mut handles = self.handles.lock();
        let idx = handles.iter().position(|(ctx, _)| *ctx == context)?;
        Some(handles.swap_remove(idx).1)
    }

    /// Removes and returns every recorded handle together with its owning
    /// context.
    pub fn take_all_handles(&self) -> Vec<(ContextId, TextureHandle)> {
        std::mem::take(&mut *self.handles.lock())
    }

    /// The contexts that currently hold a native handle for this texture.
    pub fn context_ids(&self) -> Vec<ContextId> {
        self.handles.lock().iter().map(|&(ctx, _)| ctx).collect()
    }

    pub fn has_handles(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Flags the texture as needing re-upload in every context that
    /// currently holds a handle for it.
    ///
    /// Contexts that acquire a handle later are unaffected, since their
    /// upload will use the new data anyway.
    pub fn mark_dirty(&self) {
        let contexts = self.context_ids();
        let mut dirty = self.dirty.lock();
        for context in contexts {
            if !dirty.contains(&context) {
                dirty.push(context);
            }
        }
    }

    /// Whether the texture needs re-upload in the given context.
    pub fn is_dirty(&self, context: ContextId) -> bool {
        self.dirty.lock().contains(&context)
    }

    /// Clears the re-upload flag for the given context.
    pub fn mark_clean(&self, context: ContextId) {
        self.dirty.lock().retain(|&ctx| ctx != context);
    }

    /// Registers a texture as a user of this key.
    ///
    /// Several textures can use one canonical key over time (a reload
    /// after eviction, for instance), while the handle table must stay
    /// with the key until the last of them is gone.
    pub(crate) fn register_user(&self) {
        self.users.fetch_add(1, Ordering::Relaxed);
    }

    /// Unregisters a texture as a user of this key, returning the number
    /// of remaining users.
    pub(crate) fn unregister_user(&self) -> usize {
        self.users.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

impl PartialEq for TextureKey {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.flipped == other.flipped
            && self.store_format == other.store_format
            && self.min_filter == other.min_filter
            && self.id == other.id
    }
}

impl Eq for TextureKey {}

impl Hash for TextureKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.code());
    }
}

/// Canonicalizes [`TextureKey`]s so that equal identities share a single
/// instance.
///
/// The interner holds only weak references, so a key whose every strong
/// reference has been dropped falls out of the table on the next scan.
#[derive(Debug, Default)]
pub struct KeyInterner {
    keys: Mutex<Vec<Weak<TextureKey>>>,
    next_unique: AtomicU64,
}

impl KeyInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical key for the given identity, registering it if
    /// no equal key is live.
    pub fn key(
        &self,
        source: Option<TextureSource>,
        flipped: bool,
        store_format: TextureStoreFormat,
        min_filter: MinificationFilter,
        id: Option<String>,
    ) -> Arc<TextureKey> {
        let candidate = TextureKey::new(source, flipped, store_format, min_filter, id);

        let mut keys = self.keys.lock();
        let mut found = None;
        keys.retain(|weak| match weak.upgrade() {
            Some(key) => {
                if found.is_none() && *key == candidate {
                    found = Some(key);
                }
                true
            }
            None => false,
        });
        if let Some(key) = found {
            return key;
        }

        let key = Arc::new(candidate);
        keys.push(Arc::downgrade(&key));
        key
    }

    /// Returns a fresh key that compares equal to no other, for textures
    /// rendered at runtime rather than loaded from a source.
    pub fn unique_render_key(&self, min_filter: MinificationFilter) -> Arc<TextureKey> {
        let n = self.next_unique.fetch_add(1, Ordering::Relaxed);
        self.key(
            None,
            false,
            TextureStoreFormat::default(),
            min_filter,
            Some(format!("RTT_{n}")),
        )
    }

    /// Drops the interner's registration of the given key, returning
    /// whether it was registered.
    ///
    /// A subsequent [`Self::key`] call with the same identity will produce
    /// a fresh instance with an empty handle table.
    pub fn release(&self, key: &TextureKey) -> bool {
        let mut keys = self.keys.lock();
        let mut released = false;
        keys.retain(|weak| match weak.upgrade() {
            Some(live) => {
                if !released && *live == *key {
                    released = true;
                    debug!("released texture key {live:?}");
                    false
                } else {
                    true
                }
            }
            None => false,
        });
        released
    }

    /// The number of live registered keys.
    pub fn n_live_keys(&self) -> usize {
        let mut keys = self.keys.lock();
        keys.retain(|weak| weak.strong_count() > 0);
        keys.len()
    }
}
