use crate::db::executor::ExecutionOutcome;
use crate::error::Violation;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Where the pipeline stopped for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStage {
    Completed,
    GenerationFailed,
    ValidationFailed,
    ExecutionFailed,
}

/// The full story of one request, written exactly once whether the
/// pipeline finished or died at any stage. This is the only place raw
/// model text and raw database errors are allowed to land.
#[derive(Debug, Serialize)]
pub struct ConversationRecord {
    pub tenant_id: i64,
    pub question: String,
    pub outcome_stage: OutcomeStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_attempted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_model_text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub approximate_token_cost: usize,
    pub timestamp_utc: chrono::DateTime<chrono::Utc>,
}

/// Appends conversation records to a JSONL file.
///
/// Writes are best-effort relative to the already-computed response: a
/// failed or slow append is logged and dropped, never surfaced to the
/// caller.
pub struct AuditRecorder {
    path: PathBuf,
    write_timeout: Duration,
}

impl AuditRecorder {
    pub fn new(path: impl Into<PathBuf>, write_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            write_timeout,
        }
    }

    pub async fn record(&self, record: &ConversationRecord) {
        match tokio::time::timeout(self.write_timeout, self.append(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("audit append failed: {}", e),
            Err(_) => error!(
                "audit append exceeded {}ms, record dropped",
                self.write_timeout.as_millis()
            ),
        }
    }

    async fn append(&self, record: &ConversationRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: OutcomeStage) -> ConversationRecord {
        ConversationRecord {
            tenant_id: 3,
            question: "faturamento de ontem".to_string(),
            outcome_stage: stage,
            sql_attempted: None,
            raw_model_text: Some("not even json".to_string()),
            violations: Vec::new(),
            execution: None,
            error_detail: None,
            approximate_token_cost: 420,
            timestamp_utc: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let recorder = AuditRecorder::new(&path, Duration::from_secs(1));

        recorder.record(&record(OutcomeStage::GenerationFailed)).await;
        recorder.record(&record(OutcomeStage::Completed)).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["tenant_id"], 3);
        assert_eq!(first["outcome_stage"], "generation_failed");
        assert_eq!(first["raw_model_text"], "not even json");
    }

    #[tokio::test]
    async fn append_failure_does_not_panic_or_error() {
        let recorder = AuditRecorder::new(
            "/nonexistent-dir/never/audit.jsonl",
            Duration::from_millis(200),
        );
        // Only observable effect is an error log line.
        recorder.record(&record(OutcomeStage::Completed)).await;
    }
}
