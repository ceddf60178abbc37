//! Instance registry: durable advertisements of running ingest endpoints.
//!
//! An ingest endpoint registers itself by writing one JSON file into a
//! shared registry directory. Entries are single-owner: the process that
//! wrote one deletes it on shutdown, via [`Registration::dispose`], `Drop`,
//! or the termination-signal hooks. Consumers scan the directory and must
//! treat reachability — not file presence — as the liveness signal, since a
//! hard kill can leave a stale entry behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once, OnceLock, PoisonError};

use chrono::Utc;
use nix::sys::signal::{raise, signal, SigHandler, Signal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Entry format version.
pub const REGISTRY_VERSION: u32 = 1;

/// Environment variable overriding the registry directory.
pub const REGISTRY_DIR_ENV: &str = "TATTLE_INGEST_REGISTRY_DIR";

/// Errors writing a registry entry. Read-side scans never fail; malformed
/// entries are skipped.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialisation error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One advertisement that an ingest endpoint instance is live.
///
/// `started_at` stays a string on purpose: resolvers sort by it but must
/// tolerate unparsable values (they sort last) instead of rejecting the
/// entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub version: u32,
    pub pid: u32,
    pub root_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub host: String,
    pub path: String,
    pub port: u16,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RegistryEntry {
    /// The ingest URL this entry advertises.
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Options for [`register`].
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub root_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub host: String,
    pub path: String,
    pub port: u16,
    pub session_id: Option<String>,
    /// Explicit registry directory; `None` means env var or default.
    pub registry_dir: Option<PathBuf>,
}

/// Resolve the registry directory: explicit override, then the
/// `TATTLE_INGEST_REGISTRY_DIR` env var, then `~/.tattle/ingest`.
pub fn resolve_registry_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var(REGISTRY_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tattle")
        .join("ingest")
}

/// A live registry entry owned by this process.
///
/// Dropping it (or calling [`Registration::dispose`]) removes the file;
/// termination signals remove it too, then re-raise so default process
/// termination semantics are preserved.
#[derive(Debug)]
pub struct Registration {
    file_path: PathBuf,
    entry: RegistryEntry,
    disposed: AtomicBool,
}

impl Registration {
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn entry(&self) -> &RegistryEntry {
        &self.entry
    }

    /// Remove the entry file. Idempotent; best effort.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = std::fs::remove_file(&self.file_path);
        untrack(&self.file_path);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Write a fresh registry entry for this process.
///
/// The file is written to a temporary name and renamed into place, so a
/// scanning reader never observes a partially written entry. Filenames are
/// freshly generated UUIDs — never reused, never edited after creation.
pub fn register(options: RegisterOptions) -> Result<Registration, RegistryError> {
    let registry_dir = resolve_registry_dir(options.registry_dir.as_deref());
    std::fs::create_dir_all(&registry_dir)?;

    let file_path = registry_dir.join(format!("{}.json", Uuid::new_v4()));
    let entry = RegistryEntry {
        version: REGISTRY_VERSION,
        pid: std::process::id(),
        root_dir: options.root_dir,
        config_path: options.config_path,
        host: options.host,
        path: options.path,
        port: options.port,
        started_at: Utc::now().to_rfc3339(),
        session_id: options.session_id,
    };

    write_atomic(&file_path, &serde_json::to_vec_pretty(&entry)?)?;
    track(&file_path);

    Ok(Registration {
        file_path,
        entry,
        disposed: AtomicBool::new(false),
    })
}

/// Scan a registry directory, skipping anything unreadable or malformed.
pub fn scan(registry_dir: &Path) -> Vec<RegistryEntry> {
    let entries = match std::fs::read_dir(registry_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<RegistryEntry>(&raw) {
            Ok(parsed) => found.push(parsed),
            Err(err) => {
                debug!(file = %path.display(), error = %err, "skipping malformed registry entry");
            }
        }
    }
    found
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), RegistryError> {
    let tmp = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// Entries owned by this process, unlinked by the signal hooks.
static LIVE_ENTRIES: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();
static INSTALL_HOOKS: Once = Once::new();

fn live_entries() -> &'static Mutex<Vec<PathBuf>> {
    LIVE_ENTRIES.get_or_init(|| Mutex::new(Vec::new()))
}

fn track(path: &Path) {
    live_entries()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(path.to_path_buf());
    INSTALL_HOOKS.call_once(install_signal_hooks);
}

fn untrack(path: &Path) {
    live_entries()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|p| p != path);
}

fn install_signal_hooks() {
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_termination));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle_termination));
    }
}

/// Unlink live entries, then re-raise with the default disposition so the
/// process still terminates with the expected semantics.
extern "C" fn handle_termination(sig: libc::c_int) {
    if let Some(paths) = LIVE_ENTRIES.get() {
        if let Ok(paths) = paths.try_lock() {
            for path in paths.iter() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
    if let Ok(sig) = Signal::try_from(sig) {
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
        let _ = raise(sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &Path, root: &str, port: u16) -> RegisterOptions {
        RegisterOptions {
            root_dir: PathBuf::from(root),
            config_path: None,
            host: "127.0.0.1".to_owned(),
            path: "/tattle/emit".to_owned(),
            port,
            session_id: None,
            registry_dir: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn register_then_scan_finds_the_entry() {
        let dir = TempDir::new().unwrap();
        let registration = register(options(dir.path(), "/repo", 7331)).unwrap();

        let entries = scan(dir.path());
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.version, REGISTRY_VERSION);
        assert_eq!(entry.pid, std::process::id());
        assert_eq!(entry.root_dir, PathBuf::from("/repo"));
        assert_eq!(entry.port, 7331);
        assert_eq!(entry.url(), "http://127.0.0.1:7331/tattle/emit");
        assert_eq!(entry, registration.entry());
    }

    #[test]
    fn dispose_removes_the_entry_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registration = register(options(dir.path(), "/repo", 7331)).unwrap();
        assert!(registration.file_path().exists());

        registration.dispose();
        registration.dispose();
        assert!(!registration.file_path().exists());
        assert!(scan(dir.path()).is_empty());
    }

    #[test]
    fn drop_removes_the_entry() {
        let dir = TempDir::new().unwrap();
        let path = {
            let registration = register(options(dir.path(), "/repo", 7331)).unwrap();
            registration.file_path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn scan_skips_malformed_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let _registration = register(options(dir.path(), "/repo", 7331)).unwrap();

        let entries = scan(dir.path());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(scan(&dir.path().join("nope")).is_empty());
    }

    #[test]
    fn entries_are_reader_atomic() {
        let dir = TempDir::new().unwrap();
        let _registration = register(options(dir.path(), "/repo", 7331)).unwrap();

        // No temp files linger after a successful write.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
