//! Audit and activity logs
//!
//! Append-only line-delimited JSON files. Sink failures are logged and never
//! bubble into request or task handling.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::store::Store;

/// Request context attached to audit entries
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
    /// Source address
    pub ip: String,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// User-Agent header, if any
    pub user_agent: String,
}

/// Writer for the audit and activity journals
#[derive(Debug)]
pub struct EventSink {
    audit_path: PathBuf,
    activity_path: PathBuf,
}

impl EventSink {
    /// Create a sink writing to the two configured paths
    pub fn new(audit_path: impl Into<PathBuf>, activity_path: impl Into<PathBuf>) -> Self {
        Self {
            audit_path: audit_path.into(),
            activity_path: activity_path.into(),
        }
    }

    /// Record an admission or lifecycle decision in the audit journal
    pub fn audit(&self, action: &str, store_id: &str, status: &str, detail: &str, meta: Option<&RequestMeta>) {
        let mut entry = json!({
            "ts": timestamp(),
            "action": action,
            "store": store_id,
            "status": status,
        });
        if !detail.is_empty() {
            entry["detail"] = Value::String(detail.to_string());
        }
        if let Some(meta) = meta {
            entry["ip"] = Value::String(meta.ip.clone());
            entry["method"] = Value::String(meta.method.clone());
            entry["path"] = Value::String(meta.path.clone());
            if !meta.user_agent.is_empty() {
                entry["ua"] = Value::String(meta.user_agent.clone());
            }
        }
        append_line(&self.audit_path, &entry);
    }

    /// Record a store lifecycle event in the activity journal
    pub fn activity(&self, event: &str, store: &Store, detail: &str) {
        let mut entry = json!({
            "ts": timestamp(),
            "event": event,
            "store": store.id,
            "name": store.name,
            "status": store.status,
        });
        if !detail.is_empty() {
            entry["detail"] = Value::String(detail.to_string());
        }
        append_line(&self.activity_path, &entry);
    }

    /// Trailing `limit` lines of the activity journal, oldest first.
    ///
    /// An unreadable or empty journal yields an empty list.
    pub fn read_activity(&self, limit: usize) -> Vec<String> {
        read_last_lines(&self.activity_path, limit)
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn append_line(path: &Path, entry: &Value) {
    let line = entry.to_string();
    if let Err(e) = try_append(path, &line) {
        warn!(path = %path.display(), error = %e, "event journal write failed");
    }
}

fn try_append(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{line}")
}

fn read_last_lines(path: &Path, limit: usize) -> Vec<String> {
    let Ok(data) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].iter().map(|line| line.to_string()).collect()
}
