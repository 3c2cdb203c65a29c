//! The [BitmapLoader] drives a memory tier, a disk tier and an external fetch, producing decoded bitmaps for
//! [LoadRequest]s.
//!
//! A load goes through these steps:
//!
//! - On the calling thread: reject an empty URI, replay a still-valid failure from the error ledger, or answer from
//!   the memory tier.  None of these spawn any background work.
//! - Otherwise, on the executor: memory again (another load may have just filled it), then disk, then the ledger
//!   again, then a connectivity check for URIs that need the network, and finally the fetch itself.  The result of a
//!   fetch is transformed and stored in both tiers.
//!
//! Cancellation is checked before each of those background stages.  A canceled load never calls back.  Two cache
//! writes ignore cancellation: a memory hit still warms the disk tier, and a disk hit still fills the memory tier.
//!
//! Running out of memory while decoding is survivable: the loader clears the memory tier and tries the same stage once
//! more.
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::*;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct LoaderConfig {
    /// Maximum number of URIs the error ledger remembers.
    #[builder(default = "DEFAULT_ERROR_CAPACITY")]
    pub error_capacity: usize,
    /// How long a failed fetch suppresses new fetches of the same URI.
    #[builder(default = "DEFAULT_ERROR_TTL")]
    pub error_ttl: Duration,
    /// Worker pool size.  Defaults to a size picked from the host's parallelism.
    #[builder(setter(strip_option), default)]
    pub worker_threads: Option<usize>,
    #[builder(setter(strip_option), default)]
    pub connect_timeout: Option<Duration>,
    #[builder(setter(strip_option), default)]
    pub read_timeout: Option<Duration>,
}

impl Default for LoaderConfig {
    fn default() -> LoaderConfig {
        LoaderConfig {
            error_capacity: DEFAULT_ERROR_CAPACITY,
            error_ttl: DEFAULT_ERROR_TTL,
            worker_threads: None,
            connect_timeout: None,
            read_timeout: None,
        }
    }
}

type Outcome = Result<(Loaded, BitmapSource), (LoadError, ErrorSource)>;

/// Loads bitmaps.  Cheap to clone; clones share caches, ledger and workers.
#[derive(Clone)]
pub struct BitmapLoader {
    inner: Arc<Inner>,
}

struct Inner {
    memory: Arc<dyn BitmapCache>,
    disk: Arc<dyn BitmapCache>,
    ledger: ErrorLedger,
    executor: RwLock<Arc<dyn Executor>>,
    connections: RwLock<Arc<dyn ConnectionFactory>>,
    probe: Arc<dyn ConnectivityProbe>,
    decoder: Arc<dyn Decoder>,
    dispatcher: Arc<dyn Dispatcher>,
    ui_thread: ThreadId,
}

pub struct BitmapLoaderBuilder {
    memory: Arc<dyn BitmapCache>,
    disk: Arc<dyn BitmapCache>,
    config: LoaderConfig,
    executor: Option<Arc<dyn Executor>>,
    connections: Option<Arc<dyn ConnectionFactory>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    decoder: Option<Arc<dyn Decoder>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    error_factory: Option<Arc<dyn ErrorRecordFactory>>,
    ui_thread: Option<ThreadId>,
}

impl BitmapLoaderBuilder {
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn connection_factory(mut self, connections: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn connectivity_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Overrides the time-based records built from `config.error_ttl`.
    pub fn error_record_factory(mut self, factory: Arc<dyn ErrorRecordFactory>) -> Self {
        self.error_factory = Some(factory);
        self
    }

    /// The thread which must never block on disk I/O.  Defaults to the thread calling `build`.
    pub fn ui_thread(mut self, thread: ThreadId) -> Self {
        self.ui_thread = Some(thread);
        self
    }

    pub fn build(self) -> Result<BitmapLoader, BuildError> {
        let config = self.config;
        let executor: Arc<dyn Executor> = match self.executor {
            Some(e) => e,
            None => Arc::new(match config.worker_threads {
                Some(n) => WorkerPool::new(n)?,
                None => WorkerPool::for_host()?,
            }),
        };
        let connections: Arc<dyn ConnectionFactory> = match self.connections {
            Some(c) => c,
            None => Arc::new(DefaultConnectionFactory::new(
                config.connect_timeout,
                config.read_timeout,
            )?),
        };
        let error_factory = self
            .error_factory
            .unwrap_or_else(|| Arc::new(TimedErrorRecordFactory::new(config.error_ttl)));

        Ok(BitmapLoader {
            inner: Arc::new(Inner {
                memory: self.memory,
                disk: self.disk,
                ledger: ErrorLedger::new(config.error_capacity, error_factory),
                executor: RwLock::new(executor),
                connections: RwLock::new(connections),
                probe: self.probe.unwrap_or_else(|| Arc::new(AssumeReachable)),
                decoder: self.decoder.unwrap_or_else(|| Arc::new(ImageDecoder::new())),
                dispatcher: self
                    .dispatcher
                    .unwrap_or_else(|| Arc::new(ImmediateDispatcher)),
                ui_thread: self
                    .ui_thread
                    .unwrap_or_else(|| std::thread::current().id()),
            }),
        })
    }
}

impl BitmapLoader {
    /// Start building a loader over the given tiers.  Every other collaborator has a default.
    pub fn builder(
        memory: Arc<dyn BitmapCache>,
        disk: Arc<dyn BitmapCache>,
    ) -> BitmapLoaderBuilder {
        BitmapLoaderBuilder {
            memory,
            disk,
            config: LoaderConfig::default(),
            executor: None,
            connections: None,
            probe: None,
            decoder: None,
            dispatcher: None,
            error_factory: None,
            ui_thread: None,
        }
    }

    /// A loader over the given tiers with every other collaborator defaulted.
    pub fn new(
        memory: Arc<dyn BitmapCache>,
        disk: Arc<dyn BitmapCache>,
    ) -> Result<BitmapLoader, BuildError> {
        BitmapLoader::builder(memory, disk).build()
    }

    /// Load a bitmap.
    ///
    /// The callback may run before this returns, on the calling thread: for an empty URI, a URI with a still-valid
    /// recorded failure, or a memory hit.  In those cases the returned handle is inert.  Otherwise the callback runs
    /// later through the loader's dispatcher, unless the handle is canceled first.
    pub fn load(&self, request: LoadRequest) -> CancelHandle {
        let request = Arc::new(request);

        if request.uri().is_empty() {
            if let Some(cb) = request.callback() {
                cb.on_error(&LoadError::EmptyUri, ErrorSource::Argument, &request);
            }
            return CancelHandle::inert();
        }

        if let Some(cause) = self.inner.ledger.valid_failure(request.uri()) {
            trace!(uri = request.uri(), "replaying recorded failure");
            if let Some(cb) = request.callback() {
                cb.on_error(&cause, ErrorSource::ErrorCache, &request);
            }
            return CancelHandle::inert();
        }

        let key = request.cache_key();
        if let Some(bitmap) = self.inner.memory_get(&key) {
            trace!(uri = request.uri(), key = %key, "memory hit on calling thread");
            if let Some(cb) = request.callback() {
                cb.on_success(
                    Inner::loaded(&request, bitmap),
                    BitmapSource::Memory,
                    &request,
                );
            }
            return CancelHandle::inert();
        }

        let handle = CancelHandle::armed();
        let task_handle = handle.clone();
        let inner = self.inner.clone();
        let executor = self.inner.executor.read().clone();
        executor.execute(Box::new(move || inner.run(request, key, task_handle)));
        handle
    }

    /// Look in the memory tier only.  Safe on any thread.
    pub fn get_from_memory_cache(&self, request: &LoadRequest) -> Option<Arc<Bitmap>> {
        self.inner.memory_get(&request.cache_key())
    }

    /// Look in the disk tier only.  Blocks on disk I/O, so keep this off the UI thread.
    pub fn get_from_disk_cache(&self, request: &LoadRequest) -> Option<Arc<Bitmap>> {
        self.inner.disk_get(&request.cache_key())
    }

    pub fn clear_memory_cache(&self) {
        self.inner.memory.clear();
    }

    /// Clear the disk tier.  On the UI thread this is handed to the executor; elsewhere it happens before returning.
    pub fn clear_disk_cache(&self) {
        if std::thread::current().id() == self.inner.ui_thread {
            let disk = self.inner.disk.clone();
            self.inner
                .executor
                .read()
                .clone()
                .execute(Box::new(move || disk.clear()));
        } else {
            self.inner.disk.clear();
        }
    }

    pub fn clear_all_caches(&self) {
        self.clear_memory_cache();
        self.clear_disk_cache();
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.inner.executor.write() = executor;
    }

    pub fn set_error_record_factory(&self, factory: Arc<dyn ErrorRecordFactory>) {
        self.inner.ledger.set_factory(factory);
    }

    pub fn set_connection_factory(&self, connections: Arc<dyn ConnectionFactory>) {
        *self.inner.connections.write() = connections;
    }

    pub fn memory_cache(&self) -> &Arc<dyn BitmapCache> {
        &self.inner.memory
    }

    pub fn disk_cache(&self) -> &Arc<dyn BitmapCache> {
        &self.inner.disk
    }

    pub fn error_ledger(&self) -> &ErrorLedger {
        &self.inner.ledger
    }
}

impl Inner {
    fn loaded(request: &LoadRequest, bitmap: Arc<Bitmap>) -> Loaded {
        if request.is_bounds_only() {
            Loaded::Bounds(bitmap.dimensions())
        } else {
            Loaded::Bitmap(bitmap)
        }
    }

    /// Disk entries are stored without nine-patch data, so a disk hit always reports zero padding.
    fn fill_padding(request: &LoadRequest) {
        if let Some(sink) = request.padding_sink() {
            sink.set(Padding::default());
        }
    }

    fn memory_get(&self, key: &str) -> Option<Arc<Bitmap>> {
        // The memory tier has nothing to decode, so a failure here is just a miss.
        self.memory.get(key).ok().flatten()
    }

    /// Read the disk tier, clearing the memory tier and retrying once if decoding ran out of memory.  Every other
    /// failure is a miss.
    fn disk_get(&self, key: &str) -> Option<Arc<Bitmap>> {
        match self.disk.get(key) {
            Ok(found) => found,
            Err(e) if e.is_exhaustion() => {
                warn!(key, "out of memory reading disk tier; clearing memory tier and retrying");
                self.memory.clear();
                match self.disk.get(key) {
                    Ok(found) => found,
                    Err(e) => {
                        debug!(key, error = %e, "disk tier retry failed");
                        None
                    }
                }
            }
            Err(e) => {
                debug!(key, error = %e, "disk tier lookup failed");
                None
            }
        }
    }

    fn run(self: Arc<Self>, request: Arc<LoadRequest>, key: String, handle: CancelHandle) {
        let outcome = if request.is_bounds_only() {
            self.load_bounds(&request, &key, &handle)
        } else {
            self.load_bitmap(&request, &key, &handle)
        };

        let outcome = match outcome {
            Some(o) => o,
            None => {
                debug!(uri = request.uri(), "load canceled");
                return;
            }
        };

        if request.callback().is_none() {
            return;
        }
        self.dispatcher.dispatch(Box::new(move || {
            // The caller may have given up while the result was on its way.
            if handle.is_cancelled() {
                return;
            }
            let cb = match request.callback() {
                Some(cb) => cb,
                None => return,
            };
            match outcome {
                Ok((loaded, source)) => cb.on_success(loaded, source, &request),
                Err((error, source)) => cb.on_error(&error, source, &request),
            }
        }));
    }

    fn load_bitmap(&self, request: &LoadRequest, key: &str, handle: &CancelHandle) -> Option<Outcome> {
        if handle.is_cancelled() {
            return None;
        }
        if let Some(bitmap) = self.memory_get(key) {
            // Warm the disk tier even if the load was canceled meanwhile.
            if !self.disk.contains(key) {
                self.disk.put(key, bitmap.clone());
            }
            return Some(Ok((Loaded::Bitmap(bitmap), BitmapSource::Memory)));
        }

        if handle.is_cancelled() {
            return None;
        }
        if let Some(bitmap) = self.disk_get(key) {
            trace!(uri = request.uri(), key, "disk hit");
            Inner::fill_padding(request);
            self.memory.put(key, bitmap.clone());
            return Some(Ok((Loaded::Bitmap(bitmap), BitmapSource::Disk)));
        }

        if let Some(failed) = self.check_before_fetch(request, handle)? {
            return Some(Err(failed));
        }

        let fetched = self.with_exhaustion_retry(request.uri(), || self.fetch(request));
        match fetched {
            Ok(bitmap) => {
                let bitmap = Arc::new(bitmap);
                self.memory.put(key, bitmap.clone());
                self.disk.put(key, bitmap.clone());
                debug!(uri = request.uri(), key, "fetched external bitmap");
                Some(Ok((Loaded::Bitmap(bitmap), BitmapSource::External)))
            }
            Err(e) => Some(Err(self.fetch_failed(request.uri(), e))),
        }
    }

    fn load_bounds(&self, request: &LoadRequest, key: &str, handle: &CancelHandle) -> Option<Outcome> {
        if handle.is_cancelled() {
            return None;
        }
        if let Some(bitmap) = self.disk_get(key) {
            Inner::fill_padding(request);
            return Some(Ok((Loaded::Bounds(bitmap.dimensions()), BitmapSource::Disk)));
        }

        if let Some(failed) = self.check_before_fetch(request, handle)? {
            return Some(Err(failed));
        }

        let probed = self.with_exhaustion_retry(request.uri(), || {
            let mut stream = self.connections.read().clone().open(request.uri())?;
            self.decoder.decode_bounds(&mut stream)
        });
        match probed {
            Ok(dims) => Some(Ok((Loaded::Bounds(dims), BitmapSource::External))),
            Err(e) => Some(Err(self.fetch_failed(request.uri(), e))),
        }
    }

    /// The checks between the tiers and the fetch.  `None` means canceled; `Some(Some(..))` is a failure to report.
    fn check_before_fetch(
        &self,
        request: &LoadRequest,
        handle: &CancelHandle,
    ) -> Option<Option<(LoadError, ErrorSource)>> {
        if handle.is_cancelled() {
            return None;
        }
        let uri = request.uri();
        if let Some(cause) = self.ledger.valid_failure(uri) {
            return Some(Some((cause, ErrorSource::ErrorCache)));
        }
        if needs_network(uri) && !self.probe.is_network_reachable() {
            debug!(uri, "network unreachable");
            return Some(Some((LoadError::NoNetwork, ErrorSource::NoNetwork)));
        }
        if handle.is_cancelled() {
            return None;
        }
        Some(None)
    }

    fn fetch(&self, request: &LoadRequest) -> Result<Bitmap, LoadError> {
        let connections = self.connections.read().clone();
        let mut stream = connections.open(request.uri())?;
        let mut bitmap = self
            .decoder
            .decode(&mut stream, request.options(), request.padding_sink())?;
        for t in request.transforms() {
            bitmap = t.apply(bitmap)?;
        }
        Ok(bitmap)
    }

    /// Run one fetch attempt, retrying once after clearing the memory tier if it ran out of memory.  A panic in a
    /// collaborator ends the attempt with [LoadError::Panicked].
    fn with_exhaustion_retry<T>(
        &self,
        uri: &str,
        mut attempt: impl FnMut() -> Result<T, LoadError>,
    ) -> Result<T, LoadError> {
        let mut guarded = || {
            panic::catch_unwind(AssertUnwindSafe(&mut attempt)).unwrap_or_else(|payload| {
                let cause = LoadError::from_panic(payload);
                error!(uri, %cause, "fetch attempt panicked");
                Err(cause)
            })
        };
        match guarded() {
            Err(e) if e.is_exhaustion() => {
                warn!(uri, "out of memory fetching; clearing memory tier and retrying");
                self.memory.clear();
                guarded()
            }
            other => other,
        }
    }

    /// Record a terminal fetch failure if it is worth remembering and tag it for the callback.
    fn fetch_failed(&self, uri: &str, error: LoadError) -> (LoadError, ErrorSource) {
        let source = error.fetch_source();
        debug!(uri, error = %error, ?source, "fetch failed");
        if source == ErrorSource::External {
            self.ledger.record_failure(uri, error.clone(), source);
        }
        (error, source)
    }
}
