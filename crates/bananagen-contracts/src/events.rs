use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the run's `events.jsonl`.
///
/// Every record carries `type`, `run_id`, and `ts`; the caller payload is
/// merged last and may override those defaults. One compact JSON object per
/// line, so a batch can be tailed while it runs.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<()> {
        let mut event = Map::new();
        event.insert(
            "type".to_string(),
            Value::String(event_type.to_string()),
        );
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        event.extend(payload);

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&Value::Object(event))?;

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Convenience for callers that build payloads with `serde_json::json!`.
    pub fn emit_value(&self, event_type: &str, payload: Value) -> anyhow::Result<()> {
        match payload {
            Value::Object(map) => self.emit(event_type, map),
            Value::Null => self.emit(event_type, EventPayload::new()),
            other => {
                let mut map = EventPayload::new();
                map.insert("detail".to_string(), other);
                self.emit(event_type, map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn read_lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn item_events_carry_defaults_and_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-42");

        writer.emit_value(
            "item_completed",
            json!({"index": 0, "artifact": "circle.png"}),
        )?;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], json!("item_completed"));
        assert_eq!(lines[0]["run_id"], json!("run-42"));
        assert_eq!(lines[0]["index"], json!(0));
        assert_eq!(lines[0]["artifact"], json!("circle.png"));
        DateTime::parse_from_rfc3339(lines[0]["ts"].as_str().unwrap())?;
        Ok(())
    }

    #[test]
    fn payload_fields_win_over_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-42");

        writer.emit_value("item_failed", json!({"run_id": "other-run"}))?;

        let lines = read_lines(writer.path());
        assert_eq!(lines[0]["run_id"], json!("other-run"));
        Ok(())
    }

    #[test]
    fn emit_reports_unwritable_paths() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        // the path is a directory, so the append open must fail
        let writer = EventWriter::new(temp.path(), "run-42");

        assert!(writer.emit("batch_progress", EventPayload::new()).is_err());
        Ok(())
    }

    #[test]
    fn successive_events_append() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-42");

        writer.emit("batch_started", EventPayload::new())?;
        writer.emit("batch_finished", EventPayload::new())?;

        let lines = read_lines(writer.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], json!("batch_started"));
        assert_eq!(lines[1]["type"], json!("batch_finished"));
        Ok(())
    }
}
