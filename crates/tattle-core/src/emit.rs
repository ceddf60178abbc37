//! In-process emit client.
//!
//! [`Emitter`] is the write path for code running inside the instrumented
//! process: resolve the partial event, redact it, append it to the local
//! store. Telemetry must never take the host application down, so the
//! emitter degrades instead of failing where it safely can: a disabled
//! config is a silent no-op, and a permission failure on the store disables
//! further writes for the process (with a single warning) rather than
//! erroring on every call. `TATTLE_STRICT_WRITE_ERRORS=1` opts back into
//! surfacing permission failures, for environments where a read-only store
//! is a deployment bug.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use thiserror::Error;
use tracing::warn;

use crate::config::{load_config, resolve_store_dir, TattleConfig};
use crate::event::{EventDefaults, PartialEvent};
use crate::redact::Redactor;
use crate::store::{FileStore, StoreError};

/// Environment variable opting into strict write-error propagation.
pub const STRICT_WRITE_ERRORS_ENV: &str = "TATTLE_STRICT_WRITE_ERRORS";

/// Errors surfaced by the emit path.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one emit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Event persisted under this id.
    Written(String),
    /// Nothing written: telemetry disabled or writes degraded.
    Skipped,
}

/// The in-process write path: resolve, redact, append.
#[derive(Debug)]
pub struct Emitter {
    config: TattleConfig,
    store: FileStore,
    redactor: Redactor,
    defaults: EventDefaults,
    strict_write_errors: bool,
    write_disabled: AtomicBool,
    warned: AtomicBool,
}

impl Emitter {
    /// Build an emitter from an already-loaded configuration.
    pub fn new(config: TattleConfig, root_dir: &Path) -> Self {
        let store = FileStore::new(resolve_store_dir(&config, root_dir));
        let redactor = Redactor::new(&config.redaction);
        let defaults = EventDefaults {
            service: config.default_service.clone(),
            source_kind: "sdk".to_owned(),
        };
        Self {
            config,
            store,
            redactor,
            defaults,
            strict_write_errors: std::env::var(STRICT_WRITE_ERRORS_ENV)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            write_disabled: AtomicBool::new(false),
            warned: AtomicBool::new(false),
        }
    }

    /// Build an emitter by resolving configuration from `cwd`.
    pub fn from_cwd(cwd: &Path) -> Result<Self, EmitError> {
        let loaded = load_config(cwd).map_err(|err| EmitError::Config(err.to_string()))?;
        Ok(Self::new(loaded.config, &loaded.root_dir))
    }

    #[must_use]
    pub fn with_strict_write_errors(mut self, strict: bool) -> Self {
        self.strict_write_errors = strict;
        self
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Emit one event.
    ///
    /// Returns [`EmitOutcome::Skipped`] without touching the store when
    /// telemetry is disabled or a previous permission failure degraded this
    /// emitter. Permission failures degrade (unless strict); every other
    /// store failure is returned to the caller.
    pub fn emit(&self, partial: PartialEvent) -> Result<EmitOutcome, EmitError> {
        if !self.config.enabled || self.write_disabled.load(Ordering::Relaxed) {
            return Ok(EmitOutcome::Skipped);
        }

        let event = self
            .redactor
            .redact(partial.into_event(&self.defaults));

        match self.store.append(&event) {
            Ok(()) => Ok(EmitOutcome::Written(event.id)),
            Err(err) if is_permission_error(&err) && !self.strict_write_errors => {
                self.write_disabled.store(true, Ordering::Relaxed);
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        store_dir = %self.store.dir().display(),
                        error = %err,
                        "store not writable, disabling telemetry writes for this process"
                    );
                }
                Ok(EmitOutcome::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Whether a store failure is a permission problem rather than a transient
/// or structural one. Covers the mapped `PermissionDenied` kind plus the raw
/// errnos that surface on read-only filesystems.
fn is_permission_error(err: &StoreError) -> bool {
    let StoreError::Io(io_err) = err else {
        return false;
    };
    if io_err.kind() == std::io::ErrorKind::PermissionDenied {
        return true;
    }
    matches!(
        io_err.raw_os_error(),
        Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS)
    )
}

static GLOBAL: OnceLock<Result<Emitter, String>> = OnceLock::new();

/// Emit through the process-wide emitter, initialised lazily from the
/// current working directory.
///
/// A config that fails to load degrades to a no-op after one warning; the
/// host application keeps running either way.
pub fn emit(partial: PartialEvent) -> Result<EmitOutcome, EmitError> {
    let emitter = GLOBAL.get_or_init(|| {
        let cwd = std::env::current_dir().map_err(|err| err.to_string())?;
        Emitter::from_cwd(&cwd).map_err(|err| err.to_string())
    });
    match emitter {
        Ok(emitter) => emitter.emit(partial),
        Err(reason) => {
            static WARNED: AtomicBool = AtomicBool::new(false);
            if !WARNED.swap(true, Ordering::Relaxed) {
                warn!(error = %reason, "telemetry unavailable, events will be dropped");
            }
            Ok(EmitOutcome::Skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SearchParams;
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    fn config() -> TattleConfig {
        TattleConfig {
            default_service: "cli".to_owned(),
            ..TattleConfig::default()
        }
    }

    #[test]
    fn emit_persists_a_redacted_event() {
        let dir = TempDir::new().unwrap();
        let emitter = Emitter::new(config(), dir.path());

        let mut data = Map::new();
        data.insert("token".to_owned(), Value::String("abc123".to_owned()));
        let outcome = emitter
            .emit(PartialEvent {
                message: Some("login ok".to_owned()),
                data: Some(data),
                ..PartialEvent::default()
            })
            .unwrap();
        let EmitOutcome::Written(id) = outcome else {
            panic!("expected a write");
        };

        let found = emitter.store().search(&SearchParams::default()).unwrap();
        assert_eq!(found.events.len(), 1);
        let event = &found.events[0];
        assert_eq!(event.id, id);
        assert_eq!(event.service, "cli");
        assert_eq!(event.source.kind, "sdk");
        assert_eq!(
            event.data.as_ref().unwrap()["token"],
            Value::String("[REDACTED]".to_owned())
        );
    }

    #[test]
    fn disabled_config_is_a_silent_no_op() {
        let dir = TempDir::new().unwrap();
        let emitter = Emitter::new(
            TattleConfig {
                enabled: false,
                ..config()
            },
            dir.path(),
        );

        let outcome = emitter.emit(PartialEvent::default()).unwrap();
        assert_eq!(outcome, EmitOutcome::Skipped);
        assert!(emitter
            .store()
            .search(&SearchParams::default())
            .unwrap()
            .events
            .is_empty());
    }

    #[test]
    fn permission_errors_are_classified() {
        let denied = StoreError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(is_permission_error(&denied));

        let eacces = StoreError::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert!(is_permission_error(&eacces));
        let erofs = StoreError::Io(std::io::Error::from_raw_os_error(libc::EROFS));
        assert!(is_permission_error(&erofs));

        let missing = StoreError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!is_permission_error(&missing));
    }

    #[test]
    fn non_permission_write_failures_propagate() {
        let dir = TempDir::new().unwrap();
        // A plain file where the store directory should be: appends fail
        // with a structural error, not a permission one.
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "").unwrap();

        let emitter = Emitter::new(
            TattleConfig {
                store_dir: "blocked".to_owned(),
                ..config()
            },
            dir.path(),
        );
        assert!(emitter.emit(PartialEvent::default()).is_err());
    }
}
