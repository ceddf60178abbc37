//! Forwarding proxy for browser producers.
//!
//! Dev-server setups mount this router so instrumented pages can POST to a
//! same-origin path; the proxy forwards the body verbatim to the resolved
//! ingest endpoint. When an automatically discovered endpoint stops
//! answering (its process restarted on a different port), the proxy
//! re-resolves once and retries before giving up; explicitly configured
//! endpoints are never second-guessed.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use tracing::{debug, info, warn};

use tattle_core::config::{LoadedConfig, CONFIG_FILE};
use tattle_core::resolve::IngestResolver;

use crate::http::{cors_layer, json_error, preflight_no_content};
use crate::ingest::shutdown_signal;

/// Header telling the upstream which config file governs these events.
pub const CONFIG_PATH_HEADER: &str = "x-tattle-config-path";

/// Default port for a standalone proxy.
pub const DEFAULT_PROXY_PORT: u16 = 7332;

/// Shared state for the proxy handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub resolver: Arc<IngestResolver>,
    pub client: reqwest::Client,
    /// Always forwarded as `x-tattle-config-path` so the upstream can
    /// attribute events to this project even before a config file exists.
    pub config_path: String,
}

/// Build the proxy router, serving `path`.
pub fn proxy_router(state: ProxyState, path: &str) -> Router {
    Router::new()
        .route(path, post(handle_forward))
        .layer(cors_layer())
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

async fn handle_forward(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/json")
        .to_owned();

    let resolved = state.resolver.resolve().await;
    let first_attempt = forward(&state, &resolved.url, &content_type, &body).await;
    let err = match first_attempt {
        Ok(response) => return response,
        Err(err) => err,
    };

    // One retry, and only when a re-resolution actually finds a different
    // endpoint. A repeated failure against the same URL is reported as-is.
    if resolved.auto {
        let refreshed = state.resolver.refresh().await;
        if refreshed.url != resolved.url {
            debug!(
                stale = %resolved.url,
                fresh = %refreshed.url,
                "ingest endpoint moved, retrying"
            );
            match forward(&state, &refreshed.url, &content_type, &body).await {
                Ok(response) => return response,
                Err(retry_err) => return unreachable(&refreshed.url, &retry_err),
            }
        }
    }
    unreachable(&resolved.url, &err)
}

/// Forward the raw body under the caller's content type and relay the
/// upstream answer verbatim: same status, same content type, same body.
/// The proxy adds nothing of its own to successful responses.
async fn forward(
    state: &ProxyState,
    url: &str,
    content_type: &str,
    body: &Bytes,
) -> Result<Response, reqwest::Error> {
    let upstream = state
        .client
        .post(url)
        .header(CONTENT_TYPE, content_type)
        .header(CONFIG_PATH_HEADER, &state.config_path)
        .body(body.to_vec())
        .send()
        .await?;
    let status = upstream.status();
    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
    let payload = upstream.bytes().await?;

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    Ok(builder
        .body(Body::from(payload))
        .unwrap_or_else(|_| json_error(StatusCode::BAD_GATEWAY, "Upstream unreachable")))
}

fn unreachable(url: &str, err: &reqwest::Error) -> Response {
    warn!(url = %url, error = %err, "failed to reach ingest endpoint");
    json_error(StatusCode::BAD_GATEWAY, "Upstream unreachable")
}

/// Run a standalone forwarding proxy until interrupted.
pub async fn serve(
    loaded: LoadedConfig,
    host: String,
    port: u16,
    path: String,
) -> anyhow::Result<()> {
    let resolver = IngestResolver::new(loaded.root_dir.clone());
    let state = ProxyState {
        resolver: Arc::new(resolver),
        client: reqwest::Client::new(),
        config_path: loaded
            .config_path
            .clone()
            .unwrap_or_else(|| loaded.root_dir.join(CONFIG_FILE))
            .display()
            .to_string(),
    };
    let router = proxy_router(state, &path);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    info!(addr = %listener.local_addr()?, path = %path, "forwarding proxy listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("forwarding proxy stopped");
    Ok(())
}
