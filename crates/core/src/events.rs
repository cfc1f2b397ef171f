use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde_json::{json, Value};
use ulid::Ulid;

/// Append-only JSONL log, one file per month (`YYYY-MM.jsonl`).
#[derive(Debug, Clone)]
pub struct EventSink {
    dir: PathBuf,
    node: String,
}

impl EventSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let node = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        Self {
            dir: dir.into(),
            node,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{:04}-{:02}.jsonl", at.year(), at.month()))
    }

    /// Writes one event line. Failures are logged, never returned: the event
    /// log must not affect request handling.
    pub fn write(&self, kind: &str, payload: Value) {
        let now = Utc::now();
        let path = self.file_for(now);
        let entry = json!({
            "id": Ulid::new().to_string(),
            "ts": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "kind": kind,
            "source": "binsight-core",
            "node": self.node,
            "payload": payload,
        });
        if let Err(err) = append_line(&path, &entry) {
            tracing::warn!(path = %path.display(), error = %err, "failed to write event line");
        }
    }
}

fn append_line(path: &Path, entry: &Value) -> crate::error::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let line = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}
