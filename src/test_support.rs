//! Fakes shared by the unit tests.
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::*;

pub fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn solid(width: u32, height: u32, color: [u8; 4]) -> Bitmap {
    Bitmap::new(RgbaImage::from_pixel(width, height, Rgba(color)))
}

pub fn png_bytes(bitmap: &Bitmap) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    bitmap
        .as_rgba()
        .write_to(&mut out, ImageFormat::Png)
        .expect("Encoding should succeed");
    out.into_inner()
}

pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    Success {
        loaded: Loaded,
        source: BitmapSource,
        uri: String,
        thread: std::thread::ThreadId,
    },
    Error {
        error: LoadError,
        source: ErrorSource,
        uri: String,
    },
}

impl Event {
    pub fn bitmap_source(&self) -> Option<BitmapSource> {
        match self {
            Event::Success { source, .. } => Some(*source),
            Event::Error { .. } => None,
        }
    }

    pub fn error_source(&self) -> Option<ErrorSource> {
        match self {
            Event::Error { source, .. } => Some(*source),
            Event::Success { .. } => None,
        }
    }
}

/// A callback which writes down everything it hears.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Default::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn single(&self) -> Event {
        let events = self.events();
        assert_eq!(events.len(), 1, "Expected exactly one callback, got {:?}", events);
        events[0].clone()
    }
}

impl LoadCallback for Recorder {
    fn on_success(&self, loaded: Loaded, source: BitmapSource, request: &LoadRequest) {
        self.events.lock().push(Event::Success {
            loaded,
            source,
            uri: request.uri().to_string(),
            thread: std::thread::current().id(),
        });
    }

    fn on_error(&self, error: &LoadError, source: ErrorSource, request: &LoadRequest) {
        self.events.lock().push(Event::Error {
            error: error.clone(),
            source,
            uri: request.uri().to_string(),
        });
    }
}

/// Serves canned bytes or failures per URI and counts how often each was opened.
///
/// A URI may have a queue of scripted failures which are returned before the canned bytes.
#[derive(Default)]
pub struct ScriptedConnections {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, Vec<LoadError>>>,
    opens: Mutex<HashMap<String, usize>>,
}

impl ScriptedConnections {
    pub fn new() -> Arc<ScriptedConnections> {
        Arc::new(Default::default())
    }

    pub fn serve(&self, uri: &str, bitmap: &Bitmap) {
        self.bodies.lock().insert(uri.to_string(), png_bytes(bitmap));
    }

    pub fn serve_bytes(&self, uri: &str, bytes: Vec<u8>) {
        self.bodies.lock().insert(uri.to_string(), bytes);
    }

    /// Fail the next open of `uri` with `error`.  Multiple calls queue up.
    pub fn fail_next(&self, uri: &str, error: LoadError) {
        self.failures
            .lock()
            .entry(uri.to_string())
            .or_default()
            .push(error);
    }

    pub fn opens(&self, uri: &str) -> usize {
        self.opens.lock().get(uri).copied().unwrap_or(0)
    }
}

impl ConnectionFactory for ScriptedConnections {
    fn open(&self, uri: &str) -> Result<Box<dyn Read + Send>, LoadError> {
        *self.opens.lock().entry(uri.to_string()).or_default() += 1;
        if let Some(queue) = self.failures.lock().get_mut(uri) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }
        match self.bodies.lock().get(uri) {
            Some(b) => Ok(Box::new(Cursor::new(b.clone()))),
            None => Err(LoadError::Transport("HTTP 404: Not Found".into())),
        }
    }
}

/// Runs tasks inline and counts them.
#[derive(Default)]
pub struct CountingExecutor {
    pub count: AtomicUsize,
}

impl CountingExecutor {
    pub fn new() -> Arc<CountingExecutor> {
        Arc::new(Default::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Executor for CountingExecutor {
    fn execute(&self, task: Task) {
        self.count.fetch_add(1, Ordering::SeqCst);
        task()
    }
}

/// Holds tasks until released, so tests can act between `load` and the background work.
#[derive(Default)]
pub struct ParkedExecutor {
    tasks: Mutex<Vec<Task>>,
}

impl ParkedExecutor {
    pub fn new() -> Arc<ParkedExecutor> {
        Arc::new(Default::default())
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn run_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for t in tasks {
            t();
        }
    }
}

impl Executor for ParkedExecutor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push(task);
    }
}

/// A transform which fails with resource exhaustion a set number of times before passing its input through.
pub struct ExhaustingTransform {
    remaining: AtomicUsize,
    pub calls: AtomicUsize,
}

impl ExhaustingTransform {
    pub fn new(failures: usize) -> Arc<ExhaustingTransform> {
        Arc::new(ExhaustingTransform {
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })
    }
}

impl Transform for ExhaustingTransform {
    fn id(&self) -> String {
        "exhausting".to_string()
    }

    fn apply(&self, input: Bitmap) -> Result<Bitmap, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(LoadError::OutOfMemory);
        }
        Ok(input)
    }
}
