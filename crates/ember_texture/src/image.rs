//! CPU-side image data and the loader abstraction.

use crate::key::TextureSource;
use anyhow::{Result, bail};
use rustc_hash::FxHasher;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// The layout of a single pixel in an [`Image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit red, green, blue and alpha channels.
    Rgba8,
    /// A single 8-bit luminance channel.
    Luma8,
}

impl PixelFormat {
    /// The number of bytes occupied by one pixel.
    pub const fn n_bytes(&self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::Luma8 => 1,
        }
    }
}

/// Immutable CPU-side pixel data for a texture.
///
/// The pixel buffer is shared, so cloning an image is cheap and two clones
/// always refer to the same underlying data.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    data: Arc<[u8]>,
}

impl Image {
    /// Wraps the given pixel buffer as an image with the given dimensions
    /// and pixel format.
    ///
    /// # Errors
    /// Returns an error if either dimension is zero or if the buffer length
    /// does not match the dimensions and pixel format.
    pub fn new(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<Self> {
        let data = data.into();
        if width == 0 || height == 0 {
            bail!("image dimensions must be non-zero, got {width}x{height}");
        }
        let expected_len = (width as usize) * (height as usize) * pixel_format.n_bytes();
        if data.len() != expected_len {
            bail!(
                "image data length {} does not match {width}x{height} {pixel_format:?} (expected {expected_len})",
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            pixel_format,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this image and `other` share the same underlying pixel
    /// buffer.
    pub fn shares_data_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// A hash over the full pixel contents and metadata of the image.
    ///
    /// Used to derive stable cache identities for textures created directly
    /// from in-memory images.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.width.hash(&mut hasher);
        self.height.hash(&mut hasher);
        self.pixel_format.hash(&mut hasher);
        self.data.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Source of CPU-side image data for texture loads.
///
/// Implementations decode the resource named by a [`TextureSource`],
/// applying a vertical flip when requested.
pub trait ImageLoader {
    /// Loads the image for the given source.
    ///
    /// # Errors
    /// Returns an error if the source cannot be resolved or decoded.
    fn load_image(&self, source: &TextureSource, flipped: bool) -> Result<Image>;
}
