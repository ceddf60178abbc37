//! Secret redaction applied to every event before persistence.
//!
//! [`Redactor::redact`] is a pure, deterministic transform: it scans
//! `message` and every string value in `data` for secret-shaped text and
//! replaces matches with [`REDACTED`]. Every write path (HTTP ingest, the
//! in-process emit client) runs it exactly once before `append`. Redaction
//! is fail-open: events with no sensitive content pass through untouched,
//! and absent `message`/`data` is a no-op.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::event::Event;

/// Replacement marker for scrubbed content.
pub const REDACTED: &str = "[REDACTED]";

/// `data` keys whose string values are always replaced wholesale.
pub const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "api_key",
    "apikey",
    "authorization",
    "auth",
    "cookie",
    "private_key",
];

/// Secret assignments such as `token=abc123` or `password: hunter2`.
pub const ASSIGNMENT_PATTERN: &str =
    r"(?i)\b(?:token|secret|password|passwd|api[-_]?key|access[-_]?key|auth(?:orization)?)\s*[=:]\s*[^\s,;]+";

/// Prefixed API keys (`sk-...`, `pk_...`, and similar).
pub const API_KEY_PATTERN: &str = r"\b(?:sk|pk|api|key)[-_][A-Za-z0-9]{16,}\b";

/// Bearer credentials embedded in header-like text.
pub const BEARER_PATTERN: &str = r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]{8,}";

/// JWT tokens (three-part base64url structure).
pub const JWT_PATTERN: &str = r"\beyJ[A-Za-z0-9_-]*\.eyJ[A-Za-z0-9_-]*\.[A-Za-z0-9_-]*\b";

static BUILTIN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        ASSIGNMENT_PATTERN,
        API_KEY_PATTERN,
        BEARER_PATTERN,
        JWT_PATTERN,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("built-in redaction pattern must compile"))
    .collect()
});

/// Caller-supplied additions to the built-in rules.
///
/// Part of the opaque configuration surface; invalid `extra_patterns` are
/// skipped with a warning rather than failing the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionRules {
    /// Additional `data` keys treated as sensitive.
    pub extra_keys: Vec<String>,
    /// Additional regex patterns scrubbed from string values.
    pub extra_patterns: Vec<String>,
}

/// Compiled redaction rules.
#[derive(Debug, Default)]
pub struct Redactor {
    extra_keys: Vec<String>,
    extra_patterns: Vec<Regex>,
}

impl Redactor {
    /// Compile the built-in rules plus any configured additions.
    pub fn new(rules: &RedactionRules) -> Self {
        let extra_patterns = rules
            .extra_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern = %p, error = %err, "skipping invalid redaction pattern");
                    None
                }
            })
            .collect();

        Self {
            extra_keys: rules
                .extra_keys
                .iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
            extra_patterns,
        }
    }

    /// Redact an event. Pure and idempotent.
    pub fn redact(&self, mut event: Event) -> Event {
        if let Some(message) = event.message.take() {
            event.message = Some(self.scrub_text(message));
        }

        if let Some(data) = event.data.as_mut() {
            for (key, value) in data.iter_mut() {
                if let Value::String(s) = value {
                    if self.is_sensitive_key(key) {
                        *s = REDACTED.to_owned();
                    } else {
                        *s = self.scrub_text(std::mem::take(s));
                    }
                }
            }
        }

        event
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        SENSITIVE_KEYS.contains(&key.as_str()) || self.extra_keys.iter().any(|k| *k == key)
    }

    fn scrub_text(&self, text: String) -> String {
        let mut result = text;
        for pattern in BUILTIN_PATTERNS.iter().chain(self.extra_patterns.iter()) {
            if pattern.is_match(&result) {
                result = pattern.replace_all(&result, REDACTED).into_owned();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDefaults, PartialEvent};
    use serde_json::{json, Map};

    fn make_event(message: Option<&str>, data: Option<Map<String, Value>>) -> Event {
        PartialEvent {
            message: message.map(str::to_owned),
            data,
            ..PartialEvent::default()
        }
        .into_event(&EventDefaults {
            service: "svc".to_owned(),
            source_kind: "sdk".to_owned(),
        })
    }

    fn data(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn scrubs_token_assignment_and_api_key_in_message() {
        let redactor = Redactor::default();
        let event = make_event(Some("token=abc sk-12345678901234567890"), None);

        let redacted = redactor.redact(event);
        let message = redacted.message.unwrap();
        assert!(message.contains(REDACTED));
        assert!(!message.contains("abc"));
        assert!(!message.contains("sk-12345678901234567890"));
    }

    #[test]
    fn scrubs_sensitive_data_keys_wholesale() {
        let redactor = Redactor::default();
        let event = make_event(
            None,
            Some(data(&[
                ("token", json!("abc")),
                ("user", json!("alice")),
                ("retries", json!(3)),
            ])),
        );

        let redacted = redactor.redact(event);
        let data = redacted.data.unwrap();
        assert_eq!(data["token"], json!(REDACTED));
        assert_eq!(data["user"], json!("alice"));
        // Non-string values pass through unchanged.
        assert_eq!(data["retries"], json!(3));
    }

    #[test]
    fn scrubs_patterns_inside_non_sensitive_data_values() {
        let redactor = Redactor::default();
        let event = make_event(
            None,
            Some(data(&[(
                "note",
                json!("see api_key=deadbeef for details"),
            )])),
        );

        let redacted = redactor.redact(event);
        let note = redacted.data.unwrap()["note"].as_str().unwrap().to_owned();
        assert!(note.contains(REDACTED));
        assert!(!note.contains("deadbeef"));
    }

    #[test]
    fn redaction_is_idempotent() {
        let redactor = Redactor::default();
        let event = make_event(
            Some("password: hunter2 and Bearer abcdef123456"),
            Some(data(&[("secret", json!("s3cr3t"))])),
        );

        let once = redactor.redact(event);
        let twice = redactor.redact(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn absent_message_and_data_is_a_noop() {
        let redactor = Redactor::default();
        let event = make_event(None, None);

        let redacted = redactor.redact(event.clone());
        assert_eq!(redacted, event);
    }

    #[test]
    fn clean_content_passes_through() {
        let redactor = Redactor::default();
        let event = make_event(Some("build finished in 3.2s"), None);

        let redacted = redactor.redact(event);
        assert_eq!(redacted.message.as_deref(), Some("build finished in 3.2s"));
    }

    #[test]
    fn extra_keys_and_patterns_apply() {
        let redactor = Redactor::new(&RedactionRules {
            extra_keys: vec!["license".to_owned()],
            extra_patterns: vec![r"\bACME-[0-9]{6}\b".to_owned()],
        });
        let event = make_event(
            Some("registered ACME-123456"),
            Some(data(&[("license", json!("xyz"))])),
        );

        let redacted = redactor.redact(event);
        assert!(redacted.message.unwrap().contains(REDACTED));
        assert_eq!(redacted.data.unwrap()["license"], json!(REDACTED));
    }

    #[test]
    fn invalid_extra_pattern_is_skipped() {
        let redactor = Redactor::new(&RedactionRules {
            extra_keys: vec![],
            extra_patterns: vec!["(unclosed".to_owned()],
        });
        let event = make_event(Some("hello"), None);

        let redacted = redactor.redact(event);
        assert_eq!(redacted.message.as_deref(), Some("hello"));
    }

    #[test]
    fn scrubs_jwt_tokens() {
        let redactor = Redactor::default();
        let event = make_event(
            Some("auth failed for eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.sig"),
            None,
        );

        let redacted = redactor.redact(event);
        let message = redacted.message.unwrap();
        assert!(message.contains(REDACTED));
        assert!(!message.contains("eyJhbGciOiJIUzI1NiJ9"));
    }
}
