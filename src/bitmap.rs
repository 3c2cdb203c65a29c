//! Decoded pixel data and the options controlling how it is produced.
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;

/// A decoded image held as 8-bit RGBA samples.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pixels: RgbaImage,
}

impl Bitmap {
    pub fn new(pixels: RgbaImage) -> Bitmap {
        Bitmap { pixels }
    }

    /// Build a bitmap from raw RGBA samples, returning `None` if the buffer doesn't match the dimensions.
    pub fn from_raw(width: u32, height: u32, samples: Vec<u8>) -> Option<Bitmap> {
        RgbaImage::from_raw(width, height, samples).map(Bitmap::new)
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width(),
            height: self.height(),
        }
    }

    /// Size of the sample data in bytes.  This is what the memory tier charges for the bitmap.
    pub fn byte_count(&self) -> u64 {
        self.pixels.as_raw().len() as u64
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn as_rgba_mut(&mut self) -> &mut RgbaImage {
        &mut self.pixels
    }

    pub fn into_rgba(self) -> RgbaImage {
        self.pixels
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Options applied when decoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DecodeOptions {
    /// Decode at `1 / sample_size` of the original width and height.  Values below 1 are treated as 1.
    pub sample_size: u32,
    /// Only probe the dimensions; no pixel data is materialized or cached.
    pub bounds_only: bool,
}

impl DecodeOptions {
    pub fn sampled(sample_size: u32) -> DecodeOptions {
        DecodeOptions {
            sample_size,
            ..Default::default()
        }
    }

    pub fn bounds_only() -> DecodeOptions {
        DecodeOptions {
            bounds_only: true,
            ..Default::default()
        }
    }

    pub fn effective_sample_size(&self) -> u32 {
        self.sample_size.max(1)
    }
}

impl Default for DecodeOptions {
    fn default() -> DecodeOptions {
        DecodeOptions {
            sample_size: 1,
            bounds_only: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Padding {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// A write-only side channel the decoder fills with the image's padding.
///
/// Clones share the same slot, so the caller keeps one clone and hands the other to the request.
#[derive(Clone, Debug, Default)]
pub struct PaddingSink(Arc<Mutex<Option<Padding>>>);

impl PaddingSink {
    pub fn new() -> PaddingSink {
        Default::default()
    }

    pub fn set(&self, padding: Padding) {
        *self.0.lock() = Some(padding);
    }

    /// The last padding written, if a decode has happened.
    pub fn get(&self) -> Option<Padding> {
        *self.0.lock()
    }
}

/// The value delivered to a successful callback.
#[derive(Clone, Debug)]
pub enum Loaded {
    Bitmap(Arc<Bitmap>),
    /// Result of a bounds-only load.
    Bounds(Dimensions),
}

impl Loaded {
    pub fn bitmap(&self) -> Option<&Arc<Bitmap>> {
        match self {
            Loaded::Bitmap(b) => Some(b),
            Loaded::Bounds(_) => None,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        match self {
            Loaded::Bitmap(b) => b.dimensions(),
            Loaded::Bounds(d) => *d,
        }
    }
}
