//! Telemetry event model.
//!
//! An [`Event`] is the atomic unit of telemetry. Producers hand the pipeline a
//! [`PartialEvent`] (any field may be absent); [`PartialEvent::into_event`]
//! resolves every required field from process-wide defaults so that every
//! persisted event carries `id`, `ts`, `level`, `service`, and `run_id`.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Environment variable overriding the process-wide run identifier.
pub const RUN_ID_ENV: &str = "TATTLE_RUN_ID";

/// Environment variable supplying a session identifier for all events.
pub const SESSION_ID_ENV: &str = "TATTLE_SESSION_ID";

/// Severity level of an event.
///
/// Input outside this set normalises to [`Level::Info`] rather than failing;
/// producers should never lose an event over an unknown level string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Parse a level string, normalising unknown or absent input to `info`.
    pub fn normalize(input: Option<&str>) -> Self {
        match input.map(str::to_ascii_lowercase).as_deref() {
            Some("trace") => Self::Trace,
            Some("debug") => Self::Debug,
            Some("warn") => Self::Warn,
            Some("error") => Self::Error,
            Some("fatal") => Self::Fatal,
            _ => Self::Info,
        }
    }

    /// Canonical lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Whether this level counts towards a session's `error_count`.
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Fatal)
    }
}

/// Provenance of an event.
///
/// `kind` records which entry point produced the event (`sdk`, `mcp`, ...).
/// `backend` and `backend_id` are stamped by read backends so a caller
/// aggregating several origins can tell them apart; they are a read-path
/// annotation and are never written back to storage by the query layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
}

impl Source {
    /// A source with only a kind set.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            backend: None,
            backend_id: None,
        }
    }
}

/// One structured telemetry record.
///
/// Immutable once appended; corrections are new events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub level: Level,
    #[serde(rename = "type")]
    pub event_type: String,
    pub service: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub source: Source,
}

/// Defaults applied when resolving a [`PartialEvent`].
#[derive(Debug, Clone)]
pub struct EventDefaults {
    /// Fallback `service` when the producer did not name one.
    pub service: String,
    /// `source.kind` stamped on events that carry no source.
    pub source_kind: String,
}

/// A partially specified event as accepted from producers.
///
/// `level` is a free string here so that unknown values can normalise
/// instead of failing deserialisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialEvent {
    pub id: Option<String>,
    pub ts: Option<DateTime<Utc>>,
    pub level: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub service: Option<String>,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub message: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub tags: Option<Vec<String>>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub source: Option<Source>,
}

impl PartialEvent {
    /// Resolve every required field, generating identifiers where absent.
    pub fn into_event(self, defaults: &EventDefaults) -> Event {
        Event {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            ts: self.ts.unwrap_or_else(Utc::now),
            level: Level::normalize(self.level.as_deref()),
            event_type: self.event_type.unwrap_or_else(|| "log".to_owned()),
            service: self
                .service
                .unwrap_or_else(|| defaults.service.clone()),
            run_id: self.run_id.unwrap_or_else(|| process_run_id().to_owned()),
            session_id: self
                .session_id
                .or_else(|| process_session_id().map(str::to_owned)),
            message: self.message,
            data: self.data,
            tags: self.tags,
            trace_id: self.trace_id,
            span_id: self.span_id,
            source: self
                .source
                .unwrap_or_else(|| Source::new(defaults.source_kind.clone())),
        }
    }
}

static RUN_ID: OnceLock<String> = OnceLock::new();
static SESSION_ID: OnceLock<Option<String>> = OnceLock::new();

/// The run identifier shared by every event this process emits.
///
/// Taken from `TATTLE_RUN_ID` if set, otherwise generated once and cached
/// for the life of the process.
pub fn process_run_id() -> &'static str {
    RUN_ID.get_or_init(|| {
        std::env::var(RUN_ID_ENV).unwrap_or_else(|_| Uuid::new_v4().to_string())
    })
}

/// The session identifier from `TATTLE_SESSION_ID`, if any, cached per process.
pub fn process_session_id() -> Option<&'static str> {
    SESSION_ID
        .get_or_init(|| std::env::var(SESSION_ID_ENV).ok())
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> EventDefaults {
        EventDefaults {
            service: "test-service".to_owned(),
            source_kind: "sdk".to_owned(),
        }
    }

    #[test]
    fn empty_partial_resolves_required_fields() {
        let event = PartialEvent::default().into_event(&defaults());

        assert!(!event.id.is_empty());
        assert_eq!(event.level, Level::Info);
        assert_eq!(event.event_type, "log");
        assert_eq!(event.service, "test-service");
        assert!(!event.run_id.is_empty());
        assert_eq!(event.source.kind, "sdk");
    }

    #[test]
    fn explicit_fields_are_preserved() {
        let partial = PartialEvent {
            id: Some("evt-1".to_owned()),
            level: Some("error".to_owned()),
            service: Some("worker".to_owned()),
            message: Some("boom".to_owned()),
            ..PartialEvent::default()
        };

        let event = partial.into_event(&defaults());
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.level, Level::Error);
        assert_eq!(event.service, "worker");
        assert_eq!(event.message.as_deref(), Some("boom"));
    }

    #[test]
    fn unknown_level_normalises_to_info() {
        assert_eq!(Level::normalize(Some("critical")), Level::Info);
        assert_eq!(Level::normalize(Some("")), Level::Info);
        assert_eq!(Level::normalize(None), Level::Info);
        assert_eq!(Level::normalize(Some("WARN")), Level::Warn);
    }

    #[test]
    fn error_levels_count_as_errors() {
        assert!(Level::Error.is_error());
        assert!(Level::Fatal.is_error());
        assert!(!Level::Warn.is_error());
    }

    #[test]
    fn run_id_is_stable_within_process() {
        assert_eq!(process_run_id(), process_run_id());
        assert!(!process_run_id().is_empty());
    }

    #[test]
    fn event_json_uses_wire_names() {
        let event = PartialEvent {
            event_type: Some("build".to_owned()),
            ..PartialEvent::default()
        }
        .into_event(&defaults());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "build");
        assert_eq!(json["level"], "info");
        // Absent optional payload fields are omitted entirely.
        assert!(json.get("message").is_none());
        assert!(json.get("trace_id").is_none());
    }
}
