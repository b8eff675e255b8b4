//! Texture caching and native handle lifecycle management.
//!
//! The same logical texture may be uploaded to several native rendering
//! contexts, each of which knows it under a different native handle and
//! each of which may only be touched from its owning thread. This crate
//! tracks those handles per context ([`TextureKey`]), deduplicates loads
//! through a process-wide cache ([`TextureManager`]), and reclaims native
//! handles safely once the last [`Texture`] handle is dropped
//! ([`reclaim`]): handles owned by the context active on the sweeping
//! thread are deleted immediately, all others are deferred onto that
//! context's render task queue.

pub mod context;
pub mod image;
pub mod key;
pub mod manager;
pub mod reclaim;

pub use context::{ContextId, RenderContext, TextureHandle};
pub use image::{Image, ImageLoader, PixelFormat};
pub use key::{KeyInterner, MinificationFilter, TextureKey, TextureSource, TextureStoreFormat};
pub use manager::{Texture, TextureManager};
