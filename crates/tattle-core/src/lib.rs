//! Local-first telemetry pipeline for developer tooling.
//!
//! Structured events flow from producers (the in-process [`emit`] client or
//! the HTTP ingest endpoint in `tattle-server`) through redaction into an
//! append-only JSONL store partitioned by UTC day, and back out through the
//! [`store::ReadBackend`] query surface. Running ingest endpoints advertise
//! themselves in a filesystem [`registry`], which the [`resolve`] module
//! probes to discover where a given project's events should be sent.

pub mod config;
pub mod emit;
pub mod event;
pub mod redact;
pub mod registry;
pub mod resolve;
pub mod store;

pub use config::{load_config, resolve_store_dir, ConfigError, LoadedConfig, TattleConfig};
pub use emit::{emit, EmitError, EmitOutcome, Emitter};
pub use event::{Event, EventDefaults, Level, PartialEvent, Source};
pub use redact::{RedactionRules, Redactor, REDACTED};
pub use registry::{register, Registration, RegistryEntry};
pub use resolve::{IngestResolver, ResolvedIngest, DEFAULT_INGEST_URL};
pub use store::{
    FileStore, LocalBackend, ReadBackend, SearchParams, SearchResult, SessionsParams,
    SessionsResult, StatsParams, StatsResult, StoreError,
};
