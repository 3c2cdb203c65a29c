//! A process-wide registry of named loaders and caches.
//!
//! Nothing in the loader itself looks here.  Applications which would rather not pass a loader around can register
//! one at startup and look it up by name later.
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::*;

pub const DEFAULT_LOADER: &str = "bitmap_loader";
pub const DEFAULT_MEMORY_CACHE: &str = "bitmap_memory_cache";
pub const DEFAULT_DISK_CACHE: &str = "bitmap_disk_cache";

static LOADERS: LazyLock<RwLock<HashMap<String, BitmapLoader>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));
static CACHES: LazyLock<RwLock<HashMap<String, Arc<dyn BitmapCache>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register `loader` under `name`, returning whatever was there before.
pub fn register_loader(name: &str, loader: BitmapLoader) -> Option<BitmapLoader> {
    debug!(name, "registering loader");
    LOADERS.write().insert(name.to_string(), loader)
}

pub fn loader(name: &str) -> Option<BitmapLoader> {
    LOADERS.read().get(name).cloned()
}

pub fn unregister_loader(name: &str) -> Option<BitmapLoader> {
    LOADERS.write().remove(name)
}

pub fn register_cache(name: &str, cache: Arc<dyn BitmapCache>) -> Option<Arc<dyn BitmapCache>> {
    debug!(name, "registering cache");
    CACHES.write().insert(name.to_string(), cache)
}

pub fn cache(name: &str) -> Option<Arc<dyn BitmapCache>> {
    CACHES.read().get(name).cloned()
}

pub fn unregister_cache(name: &str) -> Option<Arc<dyn BitmapCache>> {
    CACHES.write().remove(name)
}

/// Register `loader` and its tiers under the default names.
pub fn register_defaults(loader: BitmapLoader) {
    register_cache(DEFAULT_MEMORY_CACHE, loader.memory_cache().clone());
    register_cache(DEFAULT_DISK_CACHE, loader.disk_cache().clone());
    register_loader(DEFAULT_LOADER, loader);
}
