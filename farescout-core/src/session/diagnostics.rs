use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::ObservabilitySection;

use super::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// In-memory event log for one attempt. The session handle, the interceptor
/// task and the outcome matcher all append to the same log, so it is the one
/// place a failed attempt can be reconstructed from.
#[derive(Debug, Clone, Default)]
pub struct AttemptLog {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(event = %message, "session event");
        if let Ok(mut guard) = self.lines.lock() {
            guard.push(LogLine {
                at: Utc::now(),
                message,
            });
        }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .map(|line| format!("{} {}", line.at.to_rfc3339(), line.message))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What survives an attempt after its session is gone. Only the most recent
/// failed attempt and the final attempt keep theirs.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptDiagnostics {
    pub attempt: usize,
    pub outcome: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub lines: Vec<LogLine>,
    pub trace_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub scraper: String,
    pub attempt: usize,
    pub outcome: String,
    pub error: String,
    pub proxy_group: Option<String>,
    pub duration_ms: i64,
}

/// Append-only JSONL sink for failed attempts. Callers treat write failures
/// as soft: observability never takes a run down.
#[derive(Debug)]
pub struct TelemetryLog {
    log: Mutex<File>,
    path: PathBuf,
}

impl TelemetryLog {
    pub fn new(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            log: Mutex::new(file),
            path,
        })
    }

    pub fn from_config(section: &ObservabilitySection) -> SessionResult<Self> {
        Self::new(&section.failure_log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_failure(&self, record: &FailureRecord) -> SessionResult<()> {
        let json = serde_json::to_string(record)
            .map_err(|err| SessionError::Unexpected(err.to_string()))?;
        let mut guard = self
            .log
            .lock()
            .map_err(|_| SessionError::Unexpected("telemetry log poisoned".to_string()))?;
        writeln!(guard, "{json}")?;
        guard.flush()?;
        Ok(())
    }
}

/// Writes the attempt's event log as a gzip-compressed JSON artifact and
/// returns its path.
pub fn write_trace_artifact(
    dir: impl AsRef<Path>,
    run_id: Uuid,
    attempt: usize,
    lines: &[LogLine],
) -> SessionResult<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)?;
    let path = dir.join(format!("trace-{}-attempt{attempt}.json.gz", run_id.simple()));
    let payload = serde_json::to_vec_pretty(lines)
        .map_err(|err| SessionError::Unexpected(err.to_string()))?;
    let file = File::create(&path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&payload)?;
    encoder.finish()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn attempt_log_records_in_order() {
        let log = AttemptLog::new();
        log.record("goto https://example.com");
        log.record("outcome success matched");
        let lines = log.snapshot();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].message.contains("goto"));
        assert!(lines[1].message.contains("success"));
    }

    #[test]
    fn failure_records_append_jsonl() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("logs/failures.jsonl");
        let telemetry = TelemetryLog::new(&path).expect("telemetry log");
        let record = FailureRecord {
            timestamp: Utc::now(),
            run_id: Uuid::new_v4(),
            scraper: "latam".to_string(),
            attempt: 2,
            outcome: "captcha".to_string(),
            error: "blocked".to_string(),
            proxy_group: Some("latam".to_string()),
            duration_ms: 412,
        };
        telemetry.record_failure(&record).expect("record");
        telemetry.record_failure(&record).expect("record again");

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"captcha\""));
    }

    #[test]
    fn trace_artifact_round_trips_through_gzip() {
        let dir = tempdir().expect("tempdir");
        let log = AttemptLog::new();
        log.record("rule matched GET /api/flights");
        let path = write_trace_artifact(dir.path(), Uuid::new_v4(), 1, &log.snapshot())
            .expect("trace artifact");
        assert!(path.exists());

        let mut decoder = GzDecoder::new(File::open(&path).expect("open artifact"));
        let mut payload = String::new();
        decoder.read_to_string(&mut payload).expect("decompress");
        assert!(payload.contains("rule matched GET /api/flights"));
    }
}
