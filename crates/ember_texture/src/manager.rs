//! The process-wide texture cache.

use crate::{
    context::{ContextId, TextureHandle},
    image::{Image, ImageLoader},
    key::{KeyInterner, MinificationFilter, TextureKey, TextureSource, TextureStoreFormat},
    reclaim::ExpiredHandleQueue,
};
use ember_log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::{
    collections::hash_map::Entry,
    fmt,
    sync::{Arc, Weak},
};

/// A loaded texture: canonical key plus CPU-side image data.
///
/// Cloning is cheap and clones share the same cache entry. When the last
/// clone is dropped, the native handles recorded on the key are moved onto
/// the manager's expired-handle queue for the next reclamation sweep.
#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

struct TextureInner {
    key: Arc<TextureKey>,
    image: Image,
    expired: Arc<ExpiredHandleQueue>,
}

impl Texture {
    pub fn key(&self) -> &Arc<TextureKey> {
        &self.inner.key
    }

    pub fn image(&self) -> &Image {
        &self.inner.image
    }

    pub fn min_filter(&self) -> MinificationFilter {
        self.inner.key.min_filter()
    }

    pub fn store_format(&self) -> TextureStoreFormat {
        self.inner.key.store_format()
    }

    /// Records the native handle this texture has in the given context.
    pub fn set_handle(&self, context: ContextId, handle: TextureHandle) -> Option<TextureHandle> {
        self.inner.key.set_handle(context, handle)
    }

    /// The native handle this texture has in the given context, if any.
    pub fn handle_for_context(&self, context: ContextId) -> Option<TextureHandle> {
        self.inner.key.handle_for_context(context)
    }

    /// Flags the texture as needing re-upload in every context that
    /// currently holds a handle for it.
    pub fn mark_dirty(&self) {
        self.inner.key.mark_dirty();
    }

    pub fn is_dirty(&self, context: ContextId) -> bool {
        self.inner.key.is_dirty(context)
    }

    pub fn mark_clean(&self, context: ContextId) {
        self.inner.key.mark_clean(context);
    }

    /// Whether this texture and `other` refer to the same cache entry.
    pub fn shares_entry_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this texture and `other` share the same pixel buffer.
    pub fn shares_data_with(&self, other: &Self) -> bool {
        self.inner.image.shares_data_with(&other.inner.image)
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("key", &self.inner.key)
            .field("image", &self.inner.image)
            .finish()
    }
}

impl TextureInner {
    fn new(key: Arc<TextureKey>, image: Image, expired: Arc<ExpiredHandleQueue>) -> Self {
        key.register_user();
        Self {
            key,
            image,
            expired,
        }
    }
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        // The handle table lives on the canonical key, which several cache
        // entries can share over time (a reload after eviction). Only the
        // demise of the key's last user may reclaim the handles; a stale
        // entry dropping earlier must leave them with the live texture.
        if self.key.unregister_user() > 0 {
            return;
        }
        let handles = self.key.take_all_handles();
        if !handles.is_empty() {
            self.expired.push(handles);
        }
    }
}

/// Deduplicating cache of loaded textures.
///
/// The cache holds only weak references to its entries, so a texture no
/// client holds onto falls out of the cache and its native handles are
/// queued for reclamation. Load failures never surface as errors to the
/// renderer: the affected slot is served by the fallback texture instead,
/// and the failed identity is not cached so a later load may succeed.
pub struct TextureManager {
    cache: Mutex<FxHashMap<Arc<TextureKey>, Weak<TextureInner>>>,
    interner: KeyInterner,
    expired: Arc<ExpiredHandleQueue>,
    fallback: Texture,
}

impl TextureManager {
    /// Creates a manager serving the given image whenever a load fails.
    pub fn new(fallback_image: Image) -> Self {
        let interner = KeyInterner::new();
        let expired = Arc::new(ExpiredHandleQueue::default());
        let fallback_key = interner.key(
            None,
            false,
            TextureStoreFormat::default(),
            MinificationFilter::default(),
            Some("__fallback".to_string()),
        );
        let fallback = Texture {
            inner: Arc::new(TextureInner::new(
                fallback_key,
                fallback_image,
                Arc::clone(&expired),
            )),
        };
        Self {
            cache: Mutex::new(FxHashMap::default()),
            interner,
            expired,
            fallback,
        }
    }

    /// The texture served in place of failed loads.
    pub fn fallback(&self) -> Texture {
        self.fallback.clone()
    }

    /// Whether the given texture is this manager's fallback texture.
    pub fn is_fallback(&self, texture: &Texture) -> bool {
        texture.shares_entry_with(&self.fallback)
    }

    /// Returns the canonical key for the given identity.
    pub fn key(
        &self,
        source: Option<TextureSource>,
        flipped: bool,
        store_format: TextureStoreFormat,
        min_filter: MinificationFilter,
        id: Option<String>,
    ) -> Arc<TextureKey> {
        self.interner.key(source, flipped, store_format, min_filter, id)
    }

    /// Returns a fresh key equal to no other, for render-to-texture
    /// targets.
    pub fn unique_render_key(&self, min_filter: MinificationFilter) -> Arc<TextureKey> {
        self.interner.unique_render_key(min_filter)
    }

    /// Drops the canonical registration of the given key.
    pub fn release_key(&self, key: &TextureKey) -> bool {
        self.interner.release(key)
    }

    /// Looks up the cached texture for the given key without loading.
    pub fn find(&self, key: &Arc<TextureKey>) -> Option<Texture> {
        let mut cache = self.cache.lock();
        match cache.get(key).map(Weak::upgrade) {
            Some(Some(inner)) => Some(Texture { inner }),
            Some(None) => {
                cache.remove(&**key);
                None
            }
            None => None,
        }
    }

    /// Returns the texture for the given key, loading it if it is not
    /// cached.
    ///
    /// Image data is taken from `image` if provided, otherwise loaded from
    /// the key's source. If neither is possible or the load fails, the
    /// fallback texture is returned and nothing is cached under the key.
    pub fn load_from_key(
        &self,
        key: &Arc<TextureKey>,
        image: Option<Image>,
        loader: &dyn ImageLoader,
    ) -> Texture {
        if let Some(texture) = self.find(key) {
            return texture;
        }

        let image = match image {
            Some(image) => image,
            None => match key.source() {
                Some(source) => match loader.load_image(source, key.is_flipped()) {
                    Ok(image) => image,
                    Err(error) => {
                        warn!(
                            "failed to load image for texture key {key:?}, \
                             substituting fallback texture: {error:#}"
                        );
                        return self.fallback();
                    }
                },
                None => {
                    warn!(
                        "texture key {key:?} has no source and no image was supplied, \
                         substituting fallback texture"
                    );
                    return self.fallback();
                }
            },
        };

        self.insert_new(key, image)
    }

    /// Returns the texture for the given source, loading it if it is not
    /// cached.
    pub fn load(
        &self,
        loader: &dyn ImageLoader,
        source: TextureSource,
        min_filter: MinificationFilter,
        store_format: TextureStoreFormat,
        flipped: bool,
    ) -> Texture {
        let key = self.key(Some(source), flipped, store_format, min_filter, None);
        self.load_from_key(&key, None, loader)
    }

    /// Returns a texture for the given in-memory image, deduplicated by
    /// image content.
    pub fn load_from_image(
        &self,
        image: Image,
        min_filter: MinificationFilter,
        store_format: TextureStoreFormat,
    ) -> Texture {
        let key = self.key(
            None,
            false,
            store_format,
            min_filter,
            Some(format!("img_{:016x}", image.content_hash())),
        );
        if let Some(texture) = self.find(&key) {
            return texture;
        }
        self.insert_new(&key, image)
    }

    /// Caches an externally constructed texture under its key.
    ///
    /// The fallback texture, and textures carrying the fallback's pixel
    /// data, are refused so that a failed load never becomes cached under a
    /// foreign identity. Returns whether the texture was inserted.
    pub fn insert(&self, texture: &Texture) -> bool {
        if self.is_fallback(texture) || texture.shares_data_with(&self.fallback) {
            return false;
        }
        let mut cache = self.cache.lock();
        cache.insert(
            Arc::clone(texture.key()),
            Arc::downgrade(&texture.inner),
        );
        true
    }

    /// Removes the cache entry for the given key, returning the texture if
    /// it is still live.
    pub fn remove(&self, key: &TextureKey) -> Option<Texture> {
        let weak = self.cache.lock().remove(key)?;
        weak.upgrade().map(|inner| Texture { inner })
    }

    /// The number of live cache entries.
    pub fn n_cached(&self) -> usize {
        let mut cache = self.cache.lock();
        cache.retain(|_, weak| weak.strong_count() > 0);
        cache.len()
    }

    pub(crate) fn expired_queue(&self) -> &Arc<ExpiredHandleQueue> {
        &self.expired
    }

    /// The keys of all live cache entries.
    pub(crate) fn cached_keys(&self) -> Vec<Arc<TextureKey>> {
        let mut cache = self.cache.lock();
        cache.retain(|_, weak| weak.strong_count() > 0);
        cache.keys().map(Arc::clone).collect()
    }

    fn insert_new(&self, key: &Arc<TextureKey>, image: Image) -> Texture {
        // The load ran outside the cache lock, so another thread may have
        // inserted an entry for the same key in the meantime. The first
        // insertion wins and the losing load is discarded, before a
        // texture for it is ever constructed.
        let mut cache = self.cache.lock();
        let entry = cache.entry(Arc::clone(key));
        if let Entry::Occupied(occupied) = &entry
            && let Some(existing) = occupied.get().upgrade()
        {
            return Texture { inner: existing };
        }

        let inner = Arc::new(TextureInner::new(
            Arc::clone(key),
            image,
            Arc::clone(&self.expired),
        ));
        let weak = Arc::downgrade(&inner);
        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(weak);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(weak);
            }
        }
        debug!("cached texture for key {key:?}");
        Texture { inner }
    }
}

impl fmt::Debug for TextureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureManager")
            .field("n_cached", &self.n_cached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PixelFormat;
    use anyhow::{Result, bail};
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
    };

    struct CountingLoader {
        n_loads: AtomicUsize,
    }

    impl CountingLoader {
        fn new() -> Self {
            Self {
                n_loads: AtomicUsize::new(0),
            }
        }

        fn n_loads(&self) -> usize {
            self.n_loads.load(Ordering::Relaxed)
        }
    }

    impl ImageLoader for CountingLoader {
        fn load_image(&self, _source: &TextureSource, _flipped: bool) -> Result<Image> {
            self.n_loads.fetch_add(1, Ordering::Relaxed);
            Image::new(2, 2, PixelFormat::Luma8, vec![1, 2, 3, 4])
        }
    }

    struct FailingLoader;

    impl ImageLoader for FailingLoader {
        fn load_image(&self, _source: &TextureSource, _flipped: bool) -> Result<Image> {
            bail!("decode error");
        }
    }

    fn fallback_image() -> Image {
        Image::new(1, 1, PixelFormat::Rgba8, vec![255, 0, 255, 255]).unwrap()
    }

    fn stone_source() -> TextureSource {
        TextureSource::Path(PathBuf::from("assets/stone.png"))
    }

    fn ctx(id: u64) -> ContextId {
        ContextId::new(id)
    }

    fn handle(id: u32) -> TextureHandle {
        TextureHandle::new(id).unwrap()
    }

    #[test]
    fn repeated_loads_of_the_same_source_hit_the_cache() {
        let manager = TextureManager::new(fallback_image());
        let loader = CountingLoader::new();

        let first = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        let second = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );

        assert_eq!(loader.n_loads(), 1);
        assert!(first.shares_entry_with(&second));
        assert_eq!(manager.n_cached(), 1);
    }

    #[test]
    fn loads_with_differing_parameters_are_cached_separately() {
        let manager = TextureManager::new(fallback_image());
        let loader = CountingLoader::new();

        let plain = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        let flipped = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            true,
        );

        assert_eq!(loader.n_loads(), 2);
        assert!(!plain.shares_entry_with(&flipped));
        assert_eq!(manager.n_cached(), 2);
    }

    #[test]
    fn failed_load_substitutes_fallback_without_caching() {
        let manager = TextureManager::new(fallback_image());

        let texture = manager.load(
            &FailingLoader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        assert!(manager.is_fallback(&texture));
        assert_eq!(manager.n_cached(), 0);

        // The identity was not poisoned, so a later load can succeed.
        let loader = CountingLoader::new();
        let retried = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        assert!(!manager.is_fallback(&retried));
        assert_eq!(loader.n_loads(), 1);
    }

    #[test]
    fn sourceless_key_without_image_substitutes_fallback() {
        let manager = TextureManager::new(fallback_image());
        let key = manager.unique_render_key(MinificationFilter::Nearest);

        let texture = manager.load_from_key(&key, None, &FailingLoader);
        assert!(manager.is_fallback(&texture));
    }

    #[test]
    fn supplied_image_takes_precedence_over_the_loader() {
        let manager = TextureManager::new(fallback_image());
        let key = manager.key(
            Some(stone_source()),
            false,
            TextureStoreFormat::default(),
            MinificationFilter::default(),
            None,
        );
        let image = Image::new(1, 1, PixelFormat::Luma8, vec![9]).unwrap();

        let texture = manager.load_from_key(&key, Some(image.clone()), &FailingLoader);
        assert!(!manager.is_fallback(&texture));
        assert!(texture.image().shares_data_with(&image));
    }

    #[test]
    fn identical_in_memory_images_deduplicate_by_content() {
        let manager = TextureManager::new(fallback_image());
        let image = Image::new(1, 2, PixelFormat::Luma8, vec![5, 6]).unwrap();
        let same_content = Image::new(1, 2, PixelFormat::Luma8, vec![5, 6]).unwrap();
        let other_content = Image::new(1, 2, PixelFormat::Luma8, vec![5, 7]).unwrap();

        let a = manager.load_from_image(
            image,
            MinificationFilter::default(),
            TextureStoreFormat::default(),
        );
        let b = manager.load_from_image(
            same_content,
            MinificationFilter::default(),
            TextureStoreFormat::default(),
        );
        let c = manager.load_from_image(
            other_content,
            MinificationFilter::default(),
            TextureStoreFormat::default(),
        );

        assert!(a.shares_entry_with(&b));
        assert!(!a.shares_entry_with(&c));
        assert_eq!(manager.n_cached(), 2);
    }

    #[test]
    fn find_never_triggers_a_load() {
        let manager = TextureManager::new(fallback_image());
        let key = manager.key(
            Some(stone_source()),
            false,
            TextureStoreFormat::default(),
            MinificationFilter::default(),
            None,
        );
        assert!(manager.find(&key).is_none());
    }

    #[test]
    fn fallback_texture_is_never_cached_via_insert() {
        let manager = TextureManager::new(fallback_image());

        let fallback = manager.fallback();
        assert!(!manager.insert(&fallback));
        assert_eq!(manager.n_cached(), 0);
    }

    #[test]
    fn removed_entry_is_no_longer_served() {
        let manager = TextureManager::new(fallback_image());
        let loader = CountingLoader::new();

        let texture = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        let removed = manager.remove(texture.key()).unwrap();
        assert!(removed.shares_entry_with(&texture));

        assert!(manager.find(texture.key()).is_none());
        assert_eq!(manager.n_cached(), 0);
    }

    #[test]
    fn dropping_the_last_clone_queues_its_handles_for_reclamation() {
        let manager = TextureManager::new(fallback_image());
        let loader = CountingLoader::new();

        let texture = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        texture.set_handle(ctx(1), handle(11));
        texture.set_handle(ctx(2), handle(22));

        let clone = texture.clone();
        drop(texture);
        assert!(manager.expired_queue().is_empty());

        drop(clone);
        let batches = manager.expired_queue().drain();
        assert_eq!(batches.len(), 1);
        let mut batch = batches.into_iter().next().unwrap();
        batch.sort();
        assert_eq!(batch, vec![(ctx(1), handle(11)), (ctx(2), handle(22))]);

        assert_eq!(manager.n_cached(), 0);
    }

    #[test]
    fn dropping_a_texture_without_handles_queues_nothing() {
        let manager = TextureManager::new(fallback_image());
        let loader = CountingLoader::new();

        let texture = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        drop(texture);
        assert!(manager.expired_queue().is_empty());
    }

    #[test]
    fn dirty_marking_round_trips_through_the_texture() {
        let manager = TextureManager::new(fallback_image());
        let loader = CountingLoader::new();

        let texture = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        texture.set_handle(ctx(1), handle(11));
        texture.mark_dirty();

        assert!(texture.is_dirty(ctx(1)));
        texture.mark_clean(ctx(1));
        assert!(!texture.is_dirty(ctx(1)));
    }

    #[test]
    fn reloading_an_evicted_identity_keeps_handles_with_the_live_texture() {
        let manager = TextureManager::new(fallback_image());
        let loader = CountingLoader::new();

        let evicted = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        manager.remove(evicted.key());

        let reloaded = manager.load(
            &loader,
            stone_source(),
            MinificationFilter::default(),
            TextureStoreFormat::default(),
            false,
        );
        // Distinct cache entries, but the same canonical key (and thus the
        // same handle table).
        assert!(!evicted.shares_entry_with(&reloaded));
        assert!(Arc::ptr_eq(evicted.key(), reloaded.key()));

        reloaded.set_handle(ctx(1), handle(11));
        drop(evicted);

        // The stale entry's demise must not strip the live texture's
        // handle or queue it for deletion.
        assert_eq!(reloaded.handle_for_context(ctx(1)), Some(handle(11)));
        assert!(manager.expired_queue().is_empty());

        drop(reloaded);
        assert_eq!(manager.expired_queue().drain().len(), 1);
    }

    #[test]
    fn racing_loads_of_one_identity_converge_on_a_single_entry() {
        struct SlowLoader;

        impl ImageLoader for SlowLoader {
            fn load_image(&self, _source: &TextureSource, _flipped: bool) -> Result<Image> {
                std::thread::sleep(std::time::Duration::from_millis(10));
                Image::new(1, 1, PixelFormat::Luma8, vec![0])
            }
        }

        let manager = Arc::new(TextureManager::new(fallback_image()));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    manager.load(
                        &SlowLoader,
                        stone_source(),
                        MinificationFilter::default(),
                        TextureStoreFormat::default(),
                        false,
                    )
                })
            })
            .collect();
        let mut textures: Vec<_> = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect();

        for texture in &textures[1..] {
            assert!(textures[0].shares_entry_with(texture));
        }
        assert_eq!(manager.n_cached(), 1);

        // Discarded losers of the race must not disturb the winner's
        // handles.
        textures[0].set_handle(ctx(1), handle(11));
        let survivor = textures.swap_remove(0);
        drop(textures);
        assert_eq!(survivor.handle_for_context(ctx(1)), Some(handle(11)));
        assert!(manager.expired_queue().is_empty());
    }
}
