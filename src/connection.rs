//! Default network collaborators: a [ConnectionFactory] for `file`/`http`/`https` URIs and simple connectivity probes.
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;
use url::Url;

use crate::*;

/// Whether fetching `uri` needs the network.  URIs without a scheme and `file` URIs are local.
pub fn needs_network(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => url.scheme() != "file",
        Err(_) => false,
    }
}

/// Opens local files directly and everything under `http`/`https` with a blocking HTTP client.
#[derive(Debug)]
pub struct DefaultConnectionFactory {
    client: Client,
}

impl DefaultConnectionFactory {
    /// `None` leaves the corresponding timeout to the HTTP client's default.
    pub fn new(
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    ) -> Result<DefaultConnectionFactory, BuildError> {
        let mut builder = Client::builder();
        if let Some(t) = connect_timeout {
            builder = builder.connect_timeout(t);
        }
        if let Some(t) = read_timeout {
            builder = builder.timeout(t);
        }
        Ok(DefaultConnectionFactory {
            client: builder.build()?,
        })
    }

    fn open_file(path: PathBuf) -> Result<Box<dyn Read + Send>, LoadError> {
        Ok(Box::new(File::open(path)?))
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn open(&self, uri: &str) -> Result<Box<dyn Read + Send>, LoadError> {
        let url = match Url::parse(uri) {
            Ok(u) => u,
            Err(_) => return Self::open_file(PathBuf::from(uri)),
        };

        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| LoadError::UnsupportedUri(uri.to_string()))?;
                Self::open_file(path)
            }
            "http" | "https" => {
                debug!(uri, "opening connection");
                let response = self
                    .client
                    .get(url)
                    .send()
                    .map_err(|e| LoadError::Transport(e.to_string()))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(LoadError::Transport(format!(
                        "HTTP {}: {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    )));
                }
                Ok(Box::new(response))
            }
            _ => Err(LoadError::UnsupportedUri(uri.to_string())),
        }
    }
}

/// A probe for hosts which can't inspect connectivity.
#[derive(Copy, Clone, Debug, Default)]
pub struct AssumeReachable;

impl ConnectivityProbe for AssumeReachable {
    fn reachability(&self) -> Reachability {
        Reachability::Unknown
    }
}

/// A probe whose answer is set by the host, e.g. from platform connectivity notifications.
#[derive(Debug)]
pub struct StaticProbe {
    reachable: AtomicBool,
}

impl StaticProbe {
    pub fn new(reachable: bool) -> StaticProbe {
        StaticProbe {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }
}

impl ConnectivityProbe for StaticProbe {
    fn reachability(&self) -> Reachability {
        if self.reachable.load(Ordering::Relaxed) {
            Reachability::Reachable
        } else {
            Reachability::Unreachable
        }
    }
}
