//! The seams of the loader.
//!
//! The loader never reaches for a concrete cache, network stack or decoder: everything it talks to is one of the
//! traits here, handed to it at construction time.
use std::io::Read;
use std::sync::Arc;

use crate::*;

/// A key/value store of decoded bitmaps.
///
/// Both the memory tier and the disk tier implement this.  Implementations are shared between every in-flight load
/// and must do their own locking.
pub trait BitmapCache: Send + Sync {
    /// Look up a bitmap.
    ///
    /// Ordinary failures (a corrupt entry, a read error) should be reported as a miss.  Only resource exhaustion is
    /// worth an `Err`, because the loader reacts to it by freeing memory and retrying once.
    fn get(&self, key: &str) -> Result<Option<Arc<Bitmap>>, LoadError>;

    fn put(&self, key: &str, bitmap: Arc<Bitmap>);

    fn clear(&self);

    fn contains(&self, key: &str) -> bool;
}

/// Opens a byte stream for a URI.
///
/// This is where callers control timeouts, caching headers and protocol handling.  Returning
/// [LoadError::NoNetwork] flags the failure as a connectivity problem rather than an external one.
pub trait ConnectionFactory: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn Read + Send>, LoadError>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reachability {
    Reachable,
    Unreachable,
    /// The host can't tell us.  Treated as reachable.
    Unknown,
}

pub trait ConnectivityProbe: Send + Sync {
    fn reachability(&self) -> Reachability;

    fn is_network_reachable(&self) -> bool {
        self.reachability() != Reachability::Unreachable
    }
}

/// A `Decoder` knows how to get from a byte stream to pixels in memory.
pub trait Decoder: Send + Sync {
    fn decode(
        &self,
        reader: &mut dyn Read,
        options: Option<&DecodeOptions>,
        padding: Option<&PaddingSink>,
    ) -> Result<Bitmap, LoadError>;

    /// Read only as much of the stream as needed to learn the image's dimensions.
    fn decode_bounds(&self, reader: &mut dyn Read) -> Result<Dimensions, LoadError>;
}

/// A post-decode image filter.
///
/// The transform owns its input: it either hands the same bitmap back or drops it once the output exists.
pub trait Transform: Send + Sync {
    /// A short identifier which is stable for a given configuration, e.g. `r200x200`.  Part of the cache key.
    fn id(&self) -> String;

    fn apply(&self, input: Bitmap) -> Result<Bitmap, LoadError>;
}

/// Receives the outcome of a load.  Exactly one of these is called per load that isn't canceled.
pub trait LoadCallback: Send + Sync {
    fn on_success(&self, loaded: Loaded, source: BitmapSource, request: &LoadRequest);

    fn on_error(&self, error: &LoadError, source: ErrorSource, request: &LoadRequest);
}
