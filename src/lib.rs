//! An asynchronous bitmap loader with a memory tier, a disk tier and an external fetch.
//!
//! Decoding an image is expensive and fetching it over the network is more so, but a UI wants its thumbnails
//! immediately and must never block waiting for either.  This crate provides [BitmapLoader], which answers from a
//! memory tier on the calling thread when it can and otherwise does the work on a bounded pool of workers:
//!
//! - First the memory tier, a [CostBasedLru] of decoded bitmaps charged by pixel bytes ([MemoryCache]).
//! - Then the disk tier, which keeps encoded copies across runs ([DiskCache]).
//! - Finally the external fetch, through a [ConnectionFactory] and a [Decoder], followed by the request's
//!   [Transform]s.  The result fills both tiers.
//!
//! Failed fetches are remembered for a while in an [ErrorLedger], so that a broken URI in a scrolling list doesn't
//! hammer the network.  Every load returns a [CancelHandle]; a canceled load never calls back.
//!
//! To use this crate, build a [LoadRequest], hand it to [BitmapLoader::load], and receive the result through a
//! [LoadCallback].  [ViewBinder] handles the common case of one live load per display target.
mod binder;
mod bitmap;
mod connection;
mod cost_based_lru;
mod decoder;
mod disk_cache;
mod error;
mod error_ledger;
mod executor;
mod loader;
mod memory_cache;
pub mod registry;
mod request;
mod traits;
mod transforms;

#[cfg(test)]
mod test_support;

pub use binder::*;
pub use bitmap::*;
pub use connection::*;
pub use cost_based_lru::*;
pub use decoder::*;
pub use disk_cache::*;
pub use error::*;
pub use error_ledger::*;
pub use executor::*;
pub use loader::*;
pub use memory_cache::*;
pub use request::*;
pub use traits::*;
pub use transforms::*;
