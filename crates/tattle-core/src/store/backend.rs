//! Read-backend abstraction over the query surface.
//!
//! A backend is the capability set `{search, stats, sessions}`. The local
//! file store is one implementation; remote aggregators can be added behind
//! the same trait without changing callers.

use async_trait::async_trait;

use super::{
    FileStore, SearchParams, SearchResult, SessionsParams, SessionsResult, StatsParams,
    StatsResult, StoreError,
};
use crate::event::Event;

/// The query capability set implemented by every event origin.
#[async_trait]
pub trait ReadBackend: Send + Sync {
    async fn search(&self, params: &SearchParams) -> Result<SearchResult, StoreError>;
    async fn stats(&self, params: &StatsParams) -> Result<StatsResult, StoreError>;
    async fn sessions(&self, params: &SessionsParams) -> Result<SessionsResult, StoreError>;
}

/// Backend over the local [`FileStore`].
///
/// Search results are stamped with `source.backend = "local"` (and this
/// backend's id, when configured) so callers aggregating several backends
/// can tell provenance apart. The stamp is a read-path annotation only; it
/// is never written back to storage.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    store: FileStore,
    backend_id: Option<String>,
}

impl LocalBackend {
    pub fn new(store: FileStore) -> Self {
        Self {
            store,
            backend_id: None,
        }
    }

    #[must_use]
    pub fn with_backend_id(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    fn tag_local_source(&self, mut event: Event) -> Event {
        event.source.backend = Some("local".to_owned());
        if let Some(id) = &self.backend_id {
            event.source.backend_id = Some(id.clone());
        }
        event
    }
}

#[async_trait]
impl ReadBackend for LocalBackend {
    async fn search(&self, params: &SearchParams) -> Result<SearchResult, StoreError> {
        let store = self.store.clone();
        let params = params.clone();
        let mut result = run_blocking(move || store.search(&params)).await?;
        result.events = result
            .events
            .into_iter()
            .map(|event| self.tag_local_source(event))
            .collect();
        Ok(result)
    }

    async fn stats(&self, params: &StatsParams) -> Result<StatsResult, StoreError> {
        let store = self.store.clone();
        let params = params.clone();
        run_blocking(move || store.stats(&params)).await
    }

    async fn sessions(&self, params: &SessionsParams) -> Result<SessionsResult, StoreError> {
        let store = self.store.clone();
        let params = params.clone();
        run_blocking(move || store.sessions(&params)).await
    }
}

/// Run a store operation off the async executor.
async fn run_blocking<T, F>(op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StoreError::Io(std::io::Error::other(err)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDefaults, PartialEvent, Source};
    use tempfile::TempDir;

    fn store_with_event(source: Option<Source>) -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let event = PartialEvent {
            message: Some("hello".to_owned()),
            source,
            ..PartialEvent::default()
        }
        .into_event(&EventDefaults {
            service: "svc".to_owned(),
            source_kind: "sdk".to_owned(),
        });
        store.append(&event).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn search_stamps_local_provenance() {
        let (_dir, store) = store_with_event(None);
        let backend = LocalBackend::new(store.clone()).with_backend_id("dev-store");

        let result = backend.search(&SearchParams::default()).await.unwrap();
        let source = &result.events[0].source;
        assert_eq!(source.kind, "sdk");
        assert_eq!(source.backend.as_deref(), Some("local"));
        assert_eq!(source.backend_id.as_deref(), Some("dev-store"));

        // Stamping is read-path only: storage still holds the original.
        let raw = store.search(&SearchParams::default()).unwrap();
        assert_eq!(raw.events[0].source.backend, None);
    }

    #[tokio::test]
    async fn stamp_preserves_existing_backend_id_when_unconfigured() {
        let (_dir, store) = store_with_event(Some(Source {
            kind: "mcp".to_owned(),
            backend: Some("remote".to_owned()),
            backend_id: Some("agg-1".to_owned()),
        }));
        let backend = LocalBackend::new(store);

        let result = backend.search(&SearchParams::default()).await.unwrap();
        let source = &result.events[0].source;
        // `backend` is always overwritten; `kind` and an existing
        // `backend_id` survive when we have none of our own.
        assert_eq!(source.kind, "mcp");
        assert_eq!(source.backend.as_deref(), Some("local"));
        assert_eq!(source.backend_id.as_deref(), Some("agg-1"));
    }

    #[tokio::test]
    async fn stats_and_sessions_pass_through() {
        let (_dir, store) = store_with_event(None);
        let backend = LocalBackend::new(store);

        let stats = backend.stats(&StatsParams::default()).await.unwrap();
        assert_eq!(stats.buckets.len(), 1);

        let sessions = backend.sessions(&SessionsParams::default()).await.unwrap();
        assert!(sessions.sessions.is_empty());
    }
}
