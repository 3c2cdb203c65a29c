//! Failure causes and the tags describing where a result came from.
//!
//! Failures never cross the loader's public boundary as panics or `Err` returns: every cause is handed to the
//! request's callback together with an [ErrorSource].  Causes are cheap to clone so that the error ledger can replay
//! them to later requests for the same URI.
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Where a successfully loaded bitmap was found.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BitmapSource {
    Memory,
    Disk,
    External,
}

/// Where in the load sequence a failure was detected.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorSource {
    /// The request itself was malformed.
    Argument,
    /// A still-valid failure for the same URI was replayed from the error ledger.
    ErrorCache,
    /// The URI needs the network and the connectivity probe said it is unreachable.
    NoNetwork,
    /// Fetching, decoding or transforming failed.
    External,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum LoadError {
    #[error("uri is empty")]
    EmptyUri,
    #[error("no network connection")]
    NoNetwork,
    /// Memory ran out (or a decoder allocation limit was hit) while materializing pixels.
    #[error("out of memory while decoding")]
    OutOfMemory,
    #[error("I/O error: {0}")]
    Io(Arc<IoError>),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("transform {id} failed: {reason}")]
    Transform { id: String, reason: String },
    #[error("unsupported uri: {0}")]
    UnsupportedUri(String),
    /// A collaborator panicked while fetching, decoding or transforming.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl LoadError {
    /// Resource exhaustion is the only condition the loader retries.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, LoadError::OutOfMemory)
    }

    /// The tag a terminal failure of the external fetch is reported under.
    pub(crate) fn fetch_source(&self) -> ErrorSource {
        match self {
            LoadError::NoNetwork => ErrorSource::NoNetwork,
            _ => ErrorSource::External,
        }
    }

    /// Turn a caught panic payload into a cause.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> LoadError {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        LoadError::Panicked(message)
    }
}

impl From<IoError> for LoadError {
    fn from(e: IoError) -> LoadError {
        match e.kind() {
            ErrorKind::OutOfMemory => LoadError::OutOfMemory,
            _ => LoadError::Io(Arc::new(e)),
        }
    }
}

impl From<image::ImageError> for LoadError {
    fn from(e: image::ImageError) -> LoadError {
        match e {
            image::ImageError::Limits(_) => LoadError::OutOfMemory,
            image::ImageError::IoError(e) => e.into(),
            other => LoadError::Decode(other.to_string()),
        }
    }
}

/// Errors which can happen while putting a loader together.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
