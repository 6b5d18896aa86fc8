use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Snapshot of a running batch, suitable for UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

/// Final accounting for a completed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
    pub mean_item_secs: Option<f64>,
}

/// Writes `summary.json` next to the batch output, merging any extra fields
/// the caller wants recorded (run id, output directory, …) last.
pub fn write_summary(
    path: &Path,
    summary: &BatchSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("summary".to_string(), other);
            map
        }
    };
    payload.insert(
        "ts".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
    );
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

/// Humanizes a duration in seconds: `42.5s`, `3m12s`, `1h07m`.
pub fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let rest = seconds - minutes * 60.0;
        format!("{minutes:.0}m{rest:02.0}s")
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds - hours * 3600.0) / 60.0).floor();
        format!("{hours:.0}h{minutes:02.0}m")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn percent_handles_empty_and_partial_batches() {
        let empty = BatchProgress {
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
        };
        assert_eq!(empty.percent(), 100.0);
        let partial = BatchProgress {
            total: 4,
            processed: 1,
            succeeded: 1,
            failed: 0,
        };
        assert_eq!(partial.percent(), 25.0);
        assert!(!partial.is_complete());
    }

    #[test]
    fn format_duration_switches_units() {
        assert_eq!(format_duration(42.51), "42.5s");
        assert_eq!(format_duration(192.0), "3m12s");
        assert_eq!(format_duration(4020.0), "1h07m");
        assert_eq!(format_duration(-5.0), "0.0s");
    }

    #[test]
    fn write_summary_merges_extra_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");
        let summary = BatchSummary {
            total: 3,
            succeeded: 2,
            failed: 1,
            elapsed_secs: 12.5,
            mean_item_secs: Some(4.1),
        };
        let mut extra = Map::new();
        extra.insert("run_id".to_string(), json!("run-20260823"));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["total"], json!(3));
        assert_eq!(parsed["failed"], json!(1));
        assert_eq!(parsed["run_id"], json!("run-20260823"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
