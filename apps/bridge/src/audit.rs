//! Append-only JSONL audit log with sanitization, a size ring, and age purge.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::config::{AuditConfig, AuditMode};

const REDACTED: &str = "[REDACTED]";

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

const SENSITIVE_FIELD_HINTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
    "bearer",
];

/// Fields whose content is summarized away in metadata mode.
const CONTENT_FIELDS: &[&str] = &["prompt", "content", "text", "messages", "body"];

pub struct AuditLog {
    config: AuditConfig,
    chain: Mutex<()>,
}

impl AuditLog {
    #[must_use]
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            chain: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(AuditConfig {
            enabled: false,
            path: PathBuf::from("raw.jsonl"),
            max_bytes: 0,
            max_files: 0,
            max_age_days: 0,
            mode: AuditMode::Metadata,
        })
    }

    /// Appends one event line. Audit failures are logged, never surfaced to
    /// the request path.
    pub async fn record(&self, event: &str, request_id: &str, fields: Map<String, Value>) {
        if !self.config.enabled {
            return;
        }
        let mut entry = Map::new();
        entry.insert(
            "ts".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        entry.insert("event".to_string(), Value::String(event.to_string()));
        entry.insert(
            "request_id".to_string(),
            Value::String(request_id.to_string()),
        );
        for (key, value) in sanitize(fields, self.config.mode) {
            entry.insert(key, value);
        }
        let line = Value::Object(entry).to_string();

        let _chain = self.chain.lock().await;
        if let Err(err) = self.append_line(&line) {
            tracing::warn!(error = %err, "audit log write failed");
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        use std::io::Write;

        let current = std::fs::metadata(&self.config.path)
            .map(|m| m.len())
            .unwrap_or(0);
        if self.config.max_bytes > 0
            && current > 0
            && current + line.len() as u64 + 1 > self.config.max_bytes
        {
            self.rotate()?;
            self.purge_old();
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }

    fn ring_path(&self, index: u32) -> PathBuf {
        let mut name = self
            .config
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "raw.jsonl".to_string());
        name.push_str(&format!(".{index}"));
        self.config.path.with_file_name(name)
    }

    fn rotate(&self) -> std::io::Result<()> {
        if self.config.max_files == 0 {
            return std::fs::remove_file(&self.config.path);
        }
        let _ = std::fs::remove_file(self.ring_path(self.config.max_files));
        for index in (1..self.config.max_files).rev() {
            let _ = std::fs::rename(self.ring_path(index), self.ring_path(index + 1));
        }
        std::fs::rename(&self.config.path, self.ring_path(1))
    }

    fn purge_old(&self) {
        let max_age = Duration::from_secs(u64::from(self.config.max_age_days) * 24 * 60 * 60);
        if max_age.is_zero() {
            return;
        }
        for index in 1..=self.config.max_files {
            let path = self.ring_path(index);
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            let stale = metadata
                .modified()
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .is_some_and(|age| age > max_age);
            if stale {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

fn sanitize(fields: Map<String, Value>, mode: AuditMode) -> Map<String, Value> {
    match mode {
        AuditMode::Full => {
            let mut fields = redact_headers(fields);
            for (_, value) in fields.iter_mut() {
                redact_sensitive_fields(value);
            }
            fields
        }
        AuditMode::Headers => redact_headers(fields),
        AuditMode::Metadata => summarize(fields),
    }
}

fn redact_headers(mut fields: Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::Object(headers)) = fields.get_mut("headers") {
        for (name, value) in headers.iter_mut() {
            if SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str()) {
                *value = Value::String(REDACTED.to_string());
            }
        }
    }
    fields
}

fn redact_sensitive_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                let lower = key.to_lowercase();
                if SENSITIVE_FIELD_HINTS.iter().any(|hint| lower.contains(hint)) {
                    *value = Value::String(REDACTED.to_string());
                } else {
                    redact_sensitive_fields(value);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_sensitive_fields(item);
            }
        }
        _ => {}
    }
}

/// Metadata mode: headers dropped, content-bearing fields replaced by size
/// summaries, everything else kept.
fn summarize(fields: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in fields {
        if key == "headers" {
            continue;
        }
        if CONTENT_FIELDS.contains(&key.as_str()) {
            let summary = match &value {
                Value::String(s) => json!({ "chars": s.chars().count() }),
                Value::Array(items) => json!({ "items": items.len() }),
                other => json!({ "chars": other.to_string().chars().count() }),
            };
            out.insert(key, summary);
        } else {
            out.insert(key, value);
        }
    }
    out
}
