//! Append-only local event store.
//!
//! Events live under a single store directory as newline-delimited JSON,
//! partitioned into one file per UTC day (`{YYYY-MM-DD}.jsonl`). Day
//! partitioning bounds the cost of time-ranged queries — only files whose
//! date overlaps the requested range are read — and makes retention a file
//! deletion rather than a rewrite.
//!
//! Appends use `O_APPEND` writes of whole lines, which is safe for
//! concurrent writers in separate processes sharing the directory. Queries
//! read whatever files exist at call time and skip lines that fail to parse,
//! so a racing writer can never surface a partial record.

mod backend;

pub use backend::{LocalBackend, ReadBackend};

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::event::{Event, Level};

/// Result cap for `search` when the caller does not pass a limit.
///
/// The contract only requires a fixed, documented cap with a `truncated`
/// flag; 500 keeps responses comfortably small for interactive consumers.
pub const DEFAULT_SEARCH_LIMIT: usize = 500;

/// Errors from store operations. Append failures are never swallowed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialisation error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Read-only filters shared by the query operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Case-insensitive substring over `message` and string `data` values.
    pub q: Option<String>,
    pub level: Option<Level>,
    pub service: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Result cap; defaults to [`DEFAULT_SEARCH_LIMIT`].
    pub limit: Option<usize>,
}

/// Grouping key for `stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    #[default]
    Level,
    Service,
    Type,
    Day,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsParams {
    pub group_by: GroupBy,
    pub level: Option<Level>,
    pub service: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsParams {
    pub service: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Events matching a search, in ascending timestamp order.
///
/// `truncated` is true whenever more matches exist than were returned; the
/// oldest matches are the ones dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub events: Vec<Event>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsBucket {
    pub key: String,
    pub count: u64,
}

/// Counts per group key, in first-seen order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResult {
    pub buckets: Vec<StatsBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub last_ts: DateTime<Utc>,
    pub event_count: u64,
    pub error_count: u64,
}

/// Per-session fold, sorted by `last_ts` descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResult {
    pub sessions: Vec<SessionSummary>,
}

/// File-backed event store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one event to the day file for its timestamp.
    ///
    /// Safe under concurrent calls from multiple processes; a failure is
    /// always reported to the caller.
    pub fn append(&self, event: &Event) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(day_file_name(event.ts));

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Search events matching the filters.
    pub fn search(&self, params: &SearchParams) -> Result<SearchResult, StoreError> {
        let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).max(1);
        let mut events = Vec::new();

        self.for_each_event(params.since, params.until, |event| {
            if matches_search(&event, params) {
                events.push(event);
            }
        })?;

        events.sort_by_key(|e| e.ts);
        let truncated = events.len() > limit;
        if truncated {
            // Keep the newest `limit` matches, still in ascending order.
            let excess = events.len() - limit;
            events.drain(..excess);
        }

        Ok(SearchResult { events, truncated })
    }

    /// Count events per group key.
    pub fn stats(&self, params: &StatsParams) -> Result<StatsResult, StoreError> {
        let mut buckets: Vec<StatsBucket> = Vec::new();

        self.for_each_event(params.since, params.until, |event| {
            if !matches_stats(&event, params) {
                return;
            }
            let key = match params.group_by {
                GroupBy::Level => event.level.as_str().to_owned(),
                GroupBy::Service => event.service.clone(),
                GroupBy::Type => event.event_type.clone(),
                GroupBy::Day => event.ts.format("%Y-%m-%d").to_string(),
            };
            match buckets.iter_mut().find(|b| b.key == key) {
                Some(bucket) => bucket.count += 1,
                None => buckets.push(StatsBucket { key, count: 1 }),
            }
        })?;

        Ok(StatsResult { buckets })
    }

    /// Reconstruct per-session summaries by folding over matching events.
    pub fn sessions(&self, params: &SessionsParams) -> Result<SessionsResult, StoreError> {
        let mut sessions: HashMap<String, SessionSummary> = HashMap::new();

        self.for_each_event(params.since, params.until, |event| {
            if !in_time_range(&event, params.since, params.until) {
                return;
            }
            if let Some(service) = &params.service {
                if event.service != *service {
                    return;
                }
            }
            let Some(session_id) = event.session_id.clone() else {
                return;
            };

            let summary = sessions
                .entry(session_id.clone())
                .or_insert_with(|| SessionSummary {
                    session_id,
                    last_ts: event.ts,
                    event_count: 0,
                    error_count: 0,
                });
            summary.last_ts = summary.last_ts.max(event.ts);
            summary.event_count += 1;
            if event.level.is_error() {
                summary.error_count += 1;
            }
        })?;

        let mut sessions: Vec<SessionSummary> = sessions.into_values().collect();
        sessions.sort_by(|a, b| b.last_ts.cmp(&a.last_ts));
        Ok(SessionsResult { sessions })
    }

    /// Visit every parseable event in the day files overlapping the range.
    fn for_each_event<F: FnMut(Event)>(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        mut visit: F,
    ) -> Result<(), StoreError> {
        for path in self.day_files(since, until)? {
            let file = match fs::File::open(&path) {
                Ok(file) => file,
                // A racing retention pass may have deleted the file.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => visit(event),
                    Err(err) => {
                        debug!(file = %path.display(), error = %err, "skipping malformed event line");
                    }
                }
            }
        }
        Ok(())
    }

    /// Day files whose date overlaps the requested range, oldest first.
    fn day_files(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let since_day = since.map(|t| t.date_naive());
        let until_day = until.map(|t| t.date_naive());

        let mut files: Vec<(NaiveDate, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(date) = parse_day_file_name(&path) else {
                continue;
            };
            if since_day.is_some_and(|d| date < d) || until_day.is_some_and(|d| date > d) {
                continue;
            }
            files.push((date, path));
        }

        files.sort_by_key(|(date, _)| *date);
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }
}

fn day_file_name(ts: DateTime<Utc>) -> String {
    format!("{}.jsonl", ts.format("%Y-%m-%d"))
}

fn parse_day_file_name(path: &Path) -> Option<NaiveDate> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

fn in_time_range(
    event: &Event,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> bool {
    if since.is_some_and(|t| event.ts < t) {
        return false;
    }
    if until.is_some_and(|t| event.ts > t) {
        return false;
    }
    true
}

fn matches_search(event: &Event, params: &SearchParams) -> bool {
    if !in_time_range(event, params.since, params.until) {
        return false;
    }
    if params.level.is_some_and(|l| event.level != l) {
        return false;
    }
    if let Some(service) = &params.service {
        if event.service != *service {
            return false;
        }
    }
    if let Some(session_id) = &params.session_id {
        if event.session_id.as_deref() != Some(session_id.as_str()) {
            return false;
        }
    }
    if let Some(q) = &params.q {
        let needle = q.to_lowercase();
        let in_message = event
            .message
            .as_deref()
            .is_some_and(|m| m.to_lowercase().contains(&needle));
        let in_data = event.data.as_ref().is_some_and(|data| {
            data.values().any(|v| {
                v.as_str()
                    .is_some_and(|s| s.to_lowercase().contains(&needle))
            })
        });
        if !in_message && !in_data {
            return false;
        }
    }
    true
}

fn matches_stats(event: &Event, params: &StatsParams) -> bool {
    if !in_time_range(event, params.since, params.until) {
        return false;
    }
    if params.level.is_some_and(|l| event.level != l) {
        return false;
    }
    if let Some(service) = &params.service {
        if event.service != *service {
            return false;
        }
    }
    if let Some(session_id) = &params.session_id {
        if event.session_id.as_deref() != Some(session_id.as_str()) {
            return false;
        }
    }
    true
}
