//! The error ledger remembers URIs whose external fetch recently failed, so that a flood of requests for a dead image
//! doesn't turn into a flood of doomed connections.
//!
//! Each failure is stored as an [ErrorRecord] which decides for itself whether it is still valid.  The default
//! records expire a fixed time after creation.  Expired records are purged when they are read, so the ledger cleans
//! itself without a background sweep.  The ledger holds a bounded number of URIs and evicts the least recently used.
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::*;

pub const DEFAULT_ERROR_CAPACITY: usize = 200;
pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(60);

/// One remembered failure.
pub trait ErrorRecord: Send + Sync {
    fn cause(&self) -> &LoadError;

    /// Whether this failure should still short-circuit new fetches.
    fn is_valid(&self) -> bool;
}

/// Creates [ErrorRecord]s.  Replace this to get custom validity rules, e.g. dropping records once connectivity
/// returns.
pub trait ErrorRecordFactory: Send + Sync {
    fn create(&self, uri: &str, cause: LoadError, source: ErrorSource) -> Arc<dyn ErrorRecord>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Makes records which are valid for a fixed time after they were created.
pub struct TimedErrorRecordFactory {
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TimedErrorRecordFactory {
    pub fn new(ttl: Duration) -> TimedErrorRecordFactory {
        TimedErrorRecordFactory::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> TimedErrorRecordFactory {
        TimedErrorRecordFactory { ttl, clock }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for TimedErrorRecordFactory {
    fn default() -> TimedErrorRecordFactory {
        TimedErrorRecordFactory::new(DEFAULT_ERROR_TTL)
    }
}

impl ErrorRecordFactory for TimedErrorRecordFactory {
    fn create(&self, _uri: &str, cause: LoadError, _source: ErrorSource) -> Arc<dyn ErrorRecord> {
        Arc::new(TimedErrorRecord {
            cause,
            created: self.clock.now(),
            ttl: self.ttl,
            clock: self.clock.clone(),
        })
    }
}

struct TimedErrorRecord {
    cause: LoadError,
    created: Instant,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ErrorRecord for TimedErrorRecord {
    fn cause(&self) -> &LoadError {
        &self.cause
    }

    fn is_valid(&self) -> bool {
        self.clock.now().saturating_duration_since(self.created) < self.ttl
    }
}

pub struct ErrorLedger {
    records: Mutex<LruCache<String, Arc<dyn ErrorRecord>>>,
    factory: RwLock<Arc<dyn ErrorRecordFactory>>,
}

impl ErrorLedger {
    pub fn new(capacity: usize, factory: Arc<dyn ErrorRecordFactory>) -> ErrorLedger {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ErrorLedger {
            records: Mutex::new(LruCache::new(capacity)),
            factory: RwLock::new(factory),
        }
    }

    pub fn set_factory(&self, factory: Arc<dyn ErrorRecordFactory>) {
        *self.factory.write() = factory;
    }

    pub fn factory(&self) -> Arc<dyn ErrorRecordFactory> {
        self.factory.read().clone()
    }

    pub fn record_failure(&self, uri: &str, cause: LoadError, source: ErrorSource) {
        debug!(uri, error = %cause, ?source, "recording failed fetch");
        let record = self.factory.read().create(uri, cause, source);
        self.records.lock().put(uri.to_string(), record);
    }

    /// The cause of a still-valid failure for `uri`, purging the record if it has expired.
    pub fn valid_failure(&self, uri: &str) -> Option<LoadError> {
        let record = self.records.lock().get(uri).cloned()?;
        if record.is_valid() {
            return Some(record.cause().clone());
        }

        trace!(uri, "purging expired error record");
        let mut records = self.records.lock();
        // Somebody may have recorded a fresh failure since we looked; only drop the one we judged.
        if records
            .peek(uri)
            .map_or(false, |current| Arc::ptr_eq(current, &record))
        {
            records.pop(uri);
        }
        None
    }

    /// Whether any record, valid or not, is held for `uri`.  Doesn't purge.
    pub fn contains(&self, uri: &str) -> bool {
        self.records.lock().contains(uri)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Default for ErrorLedger {
    fn default() -> ErrorLedger {
        ErrorLedger::new(
            DEFAULT_ERROR_CAPACITY,
            Arc::new(TimedErrorRecordFactory::default()),
        )
    }
}
