//! Ingest endpoint discovery.
//!
//! Given a project root, [`IngestResolver`] finds a reachable ingest URL by
//! scanning the instance registry and probing candidates, newest first. No
//! reachable candidate is not an error: resolution falls back to the fixed
//! well-known endpoint, and only a later forwarding failure against it is
//! surfaced to the caller.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::DateTime;
use tracing::debug;

use crate::registry::{resolve_registry_dir, scan, RegistryEntry};

/// Fallback ingest endpoint when discovery finds nothing reachable.
pub const DEFAULT_INGEST_URL: &str = "http://127.0.0.1:7331/tattle/emit";

/// Environment variable carrying an explicitly configured ingest URL.
pub const INGEST_URL_ENV: &str = "TATTLE_INGEST_URL";

/// Per-candidate probe timeout. Candidates are local processes; anything
/// slower than this is treated as unreachable within the resolution pass.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(400);

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIngest {
    pub url: String,
    /// True when the URL came from discovery (and may be refreshed);
    /// explicitly configured endpoints are never refreshed.
    pub auto: bool,
}

/// Discovers and caches an ingest endpoint for one project root.
#[derive(Debug)]
pub struct IngestResolver {
    root_dir: PathBuf,
    registry_dir: PathBuf,
    explicit_url: Option<String>,
    probe_timeout: Duration,
    client: reqwest::Client,
    cached: Mutex<Option<String>>,
}

impl IngestResolver {
    /// Resolver for `root_dir` using the default registry directory and the
    /// `TATTLE_INGEST_URL` override if set.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            registry_dir: resolve_registry_dir(None),
            explicit_url: std::env::var(INGEST_URL_ENV).ok(),
            probe_timeout: PROBE_TIMEOUT,
            client: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_registry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.registry_dir = dir.into();
        self
    }

    /// Explicitly configure the endpoint, bypassing discovery entirely.
    #[must_use]
    pub fn with_explicit_url(mut self, url: impl Into<String>) -> Self {
        self.explicit_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Resolve an ingest URL. Automatic resolutions are cached until
    /// [`IngestResolver::refresh`] discards them.
    pub async fn resolve(&self) -> ResolvedIngest {
        if let Some(url) = &self.explicit_url {
            return ResolvedIngest {
                url: url.clone(),
                auto: false,
            };
        }

        if let Some(url) = self.cached_url() {
            return ResolvedIngest { url, auto: true };
        }

        let url = self.discover().await;
        *self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        ResolvedIngest { url, auto: true }
    }

    /// Discard any cached automatic resolution and resolve again.
    ///
    /// A no-op shortcut to [`IngestResolver::resolve`] for explicitly
    /// configured endpoints.
    pub async fn refresh(&self) -> ResolvedIngest {
        if self.explicit_url.is_none() {
            self.cached
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        self.resolve().await
    }

    fn cached_url(&self) -> Option<String> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn discover(&self) -> String {
        let mut candidates: Vec<RegistryEntry> = scan(&self.registry_dir)
            .into_iter()
            .filter(|entry| entry.root_dir == self.root_dir)
            .collect();

        // Most recent first; unparsable timestamps sort last.
        candidates.sort_by_key(|entry| {
            std::cmp::Reverse(
                DateTime::parse_from_rfc3339(&entry.started_at)
                    .map(|t| t.timestamp_millis())
                    .unwrap_or(i64::MIN),
            )
        });

        for entry in &candidates {
            let url = entry.url();
            if self.probe(&url).await {
                debug!(url = %url, pid = entry.pid, "discovered live ingest endpoint");
                return url;
            }
        }

        debug!(
            candidates = candidates.len(),
            "no reachable ingest endpoint, using fallback"
        );
        DEFAULT_INGEST_URL.to_owned()
    }

    /// Lightweight reachability check: any non-5xx answer counts as alive.
    async fn probe(&self, url: &str) -> bool {
        let request = self
            .client
            .request(reqwest::Method::OPTIONS, url)
            .timeout(self.probe_timeout);
        match request.send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(_) => false,
        }
    }
}
