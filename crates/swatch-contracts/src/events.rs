use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventFields = Map<String, Value>;

/// Append-only JSONL telemetry for one run.
///
/// Every line is one compact JSON object carrying the default keys `event`,
/// `run_id`, and `ts` (RFC 3339 UTC); caller fields are merged on top and
/// may override the defaults. Cloning shares the underlying file handle, so
/// one log can be written from several worker threads of the same run.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    run_id: String,
    sink: Mutex<File>,
}

impl EventLog {
    /// Opens (or creates) the log in append mode, creating parent
    /// directories as needed.
    pub fn create(path: impl Into<PathBuf>, run_id: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Arc::new(EventLogInner {
                path,
                run_id: run_id.into(),
                sink: Mutex::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn record(&self, event: &str, fields: EventFields) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        row.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in fields {
            row.insert(key, value);
        }

        let line = serde_json::to_string(&row)?;
        let mut sink = self
            .inner
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;
        sink.flush()?;

        Ok(Value::Object(row))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
