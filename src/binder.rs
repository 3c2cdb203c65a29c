//! Binds loads to display targets.
//!
//! A [ViewBinder] keeps at most one live load per target: issuing a new load for a target cancels the previous one,
//! so a recycled target never shows a stale image.  Entries stay in the binder until [ViewBinder::detach] is called
//! for the target.  Forgetting to detach leaks the entry but never a running load, since each load's handle cancels
//! independently.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::*;

/// Applies load results to one kind of target.
pub trait TargetAdapter<T>: Send + Sync {
    fn on_success(&self, target: &T, loaded: &Loaded, source: BitmapSource);
    fn on_error(&self, target: &T, error: &LoadError, source: ErrorSource);
}

pub struct ViewBinder<T, A> {
    loader: BitmapLoader,
    adapter: Arc<A>,
    handles: Mutex<HashMap<T, CancelHandle, ahash::RandomState>>,
}

impl<T, A> ViewBinder<T, A>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    A: TargetAdapter<T> + 'static,
{
    pub fn new(loader: BitmapLoader, adapter: Arc<A>) -> ViewBinder<T, A> {
        ViewBinder {
            loader,
            adapter,
            handles: Mutex::new(Default::default()),
        }
    }

    pub fn loader(&self) -> &BitmapLoader {
        &self.loader
    }

    /// Load `request` into `target`, canceling whatever was loading into it before.
    ///
    /// The adapter sees the result first, then the request's own callback if it has one.
    pub fn load(&self, target: T, request: LoadRequest) -> CancelHandle {
        self.cancel(&target);

        let bound = Arc::new(BoundCallback {
            target: target.clone(),
            adapter: self.adapter.clone(),
            next: request.callback().cloned(),
        });
        let handle = self.loader.load(request.with_callback(bound));

        if let Some(previous) = self.handles.lock().insert(target, handle.clone()) {
            // Someone else loaded into this target while we were issuing.
            previous.cancel();
        }
        handle
    }

    /// Cancel the load for `target`, if any.  The target stays tracked.
    pub fn cancel(&self, target: &T) {
        if let Some(h) = self.handles.lock().get(target) {
            trace!("canceling previous load for target");
            h.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for h in self.handles.lock().values() {
            h.cancel();
        }
    }

    /// Cancel the load for `target` and forget the target.
    pub fn detach(&self, target: &T) {
        if let Some(h) = self.handles.lock().remove(target) {
            h.cancel();
        }
    }

    /// Number of targets currently tracked.
    pub fn tracked(&self) -> usize {
        self.handles.lock().len()
    }
}

struct BoundCallback<T, A> {
    target: T,
    adapter: Arc<A>,
    next: Option<Arc<dyn LoadCallback>>,
}

impl<T, A> LoadCallback for BoundCallback<T, A>
where
    T: Send + Sync,
    A: TargetAdapter<T>,
{
    fn on_success(&self, loaded: Loaded, source: BitmapSource, request: &LoadRequest) {
        self.adapter.on_success(&self.target, &loaded, source);
        if let Some(next) = &self.next {
            next.on_success(loaded, source, request);
        }
    }

    fn on_error(&self, error: &LoadError, source: ErrorSource, request: &LoadRequest) {
        self.adapter.on_error(&self.target, error, source);
        if let Some(next) = &self.next {
            next.on_error(error, source, request);
        }
    }
}
