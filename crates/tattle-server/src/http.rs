//! Shared HTTP plumbing for the ingest and proxy routers.

use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS for browser producers.
///
/// The endpoint only ever binds loopback, so the origin check adds nothing;
/// what matters is that instrumented pages on any dev-server origin can
/// POST events without a preflight failure.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Rewrite OPTIONS answers to 204 No Content.
///
/// The CORS layer answers every OPTIONS request itself with 200; wrap it
/// with this (outermost) so probes and preflights see 204 while keeping the
/// CORS headers it set.
pub async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

/// The JSON error envelope every non-2xx response uses.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "ok": false, "error": message.into() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_shape() {
        let response = json_error(StatusCode::FORBIDDEN, "Telemetry disabled");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
