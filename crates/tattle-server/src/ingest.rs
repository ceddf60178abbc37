//! HTTP ingest endpoint.
//!
//! Accepts telemetry from producers that cannot link the emit client
//! directly (browser pages, other processes) and runs the same pipeline as
//! the in-process path: resolve the partial event, redact, append. Admission
//! checks run before any body handling so a disabled or oversized request is
//! rejected without buffering or parsing it further.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};

use tattle_core::config::{resolve_store_dir, LoadedConfig, TattleConfig};
use tattle_core::event::{EventDefaults, PartialEvent};
use tattle_core::redact::Redactor;
use tattle_core::registry::{register, RegisterOptions};
use tattle_core::store::FileStore;

use crate::http::{cors_layer, json_error, preflight_no_content};

/// Route the ingest endpoint is served under.
pub const DEFAULT_INGEST_PATH: &str = "/tattle/emit";

/// Well-known port; matches the discovery fallback URL.
pub const DEFAULT_INGEST_PORT: u16 = 7331;

/// Request body cap. Telemetry events are small; anything larger is a
/// producer bug, not a bigger event.
pub const DEFAULT_MAX_BODY_BYTES: usize = 512 * 1024;

/// Shared state for the ingest handlers.
#[derive(Clone)]
pub struct IngestState {
    pub config: Arc<TattleConfig>,
    pub store: Arc<FileStore>,
    pub redactor: Arc<Redactor>,
}

impl IngestState {
    pub fn new(config: TattleConfig, store: FileStore) -> Self {
        let redactor = Redactor::new(&config.redaction);
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            redactor: Arc::new(redactor),
        }
    }
}

/// Build the ingest router.
///
/// OPTIONS requests (discovery probes and browser preflights) are answered
/// by the CORS layer and normalised to 204; only POSTs reach the handler.
pub fn ingest_router(state: IngestState, path: &str, max_body_bytes: usize) -> Router {
    Router::new()
        .route(path, post(handle_emit))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_enabled,
        ))
        .layer(cors_layer())
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

/// Reject event submissions when telemetry is disabled, before the request
/// body is read. Probes and CORS preflights still get an answer.
async fn require_enabled(
    State(state): State<IngestState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::OPTIONS && !state.config.enabled {
        return json_error(StatusCode::FORBIDDEN, "Telemetry disabled");
    }
    next.run(request).await
}

async fn handle_emit(
    State(state): State<IngestState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => return json_error(rejection.status(), rejection.body_text()),
    };

    let partial: PartialEvent = match serde_json::from_slice(&body) {
        Ok(partial) => partial,
        Err(err) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                format!("Invalid event payload: {err}"),
            );
        }
    };

    let defaults = EventDefaults {
        service: state.config.default_service.clone(),
        source_kind: "mcp".to_owned(),
    };
    let event = state.redactor.redact(partial.into_event(&defaults));
    let id = event.id.clone();

    let store = Arc::clone(&state.store);
    let append = tokio::task::spawn_blocking(move || store.append(&event)).await;
    match append {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({ "ok": true, "id": id }))).into_response(),
        Ok(Err(err)) => {
            warn!(error = %err, "failed to persist ingested event");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist event")
        }
        Err(err) => {
            warn!(error = %err, "append task failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist event")
        }
    }
}

/// Options for [`serve`].
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_body_bytes: usize,
    pub session_id: Option<String>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_INGEST_PORT,
            path: DEFAULT_INGEST_PATH.to_owned(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            session_id: None,
        }
    }
}

/// Run the ingest endpoint until interrupted.
///
/// Binds the requested port, falling back to an ephemeral one when it is
/// taken (another instance may already own the well-known port), registers
/// the actual address in the instance registry, and removes the entry again
/// on shutdown.
pub async fn serve(loaded: LoadedConfig, options: ServeOptions) -> anyhow::Result<()> {
    let store = FileStore::new(resolve_store_dir(&loaded.config, &loaded.root_dir));
    let state = IngestState::new(loaded.config, store);
    let router = ingest_router(state, &options.path, options.max_body_bytes);

    let listener = match tokio::net::TcpListener::bind((options.host.as_str(), options.port)).await
    {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            warn!(
                port = options.port,
                "port in use, falling back to an ephemeral port"
            );
            tokio::net::TcpListener::bind((options.host.as_str(), 0)).await?
        }
        Err(err) => return Err(err.into()),
    };
    let local_addr = listener.local_addr()?;

    let registration = register(RegisterOptions {
        root_dir: loaded.root_dir.clone(),
        config_path: loaded.config_path.clone(),
        host: options.host.clone(),
        path: options.path.clone(),
        port: local_addr.port(),
        session_id: options.session_id.clone(),
        registry_dir: None,
    })?;

    info!(
        addr = %local_addr,
        path = %options.path,
        root_dir = %loaded.root_dir.display(),
        "ingest endpoint listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registration.dispose();
    info!("ingest endpoint stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
