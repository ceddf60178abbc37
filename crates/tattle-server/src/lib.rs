//! HTTP surface of the telemetry pipeline: the ingest endpoint that
//! persists events for a project, and the forwarding proxy that gives
//! browser producers a same-origin path to it.

pub mod http;
pub mod ingest;
pub mod proxy;
