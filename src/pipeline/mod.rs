use crate::audit::{AuditRecorder, ConversationRecord, OutcomeStage};
use crate::catalog::SchemaSnapshot;
use crate::db::executor::QueryExecutor;
use crate::error::PipelineError;
use crate::guard::{self, GuardConfig, TimeoutClass};
use crate::llm::models::{self, AnalysisType, Complexity, ContractFailure};
use crate::llm::{prompt, LlmManager};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One inbound question, immutable for the lifetime of the request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub tenant_id: i64,
    pub question: String,
    pub analysis_type: AnalysisType,
}

/// Shared counters, the pipeline's only cross-request mutable state.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub requests: AtomicU64,
    pub rejected: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub rejected: u64,
    pub executed: u64,
    pub failed: u64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlSection {
    pub query: String,
    pub explanation: String,
    pub columns: Vec<String>,
    pub complexity: Complexity,
    pub estimated_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSection {
    pub executed: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub row_count: usize,
}

/// The outbound body. Failure responses never carry SQL text or raw
/// diagnostics, only the taxonomy code and a safe message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<SqlSection>,
    pub execution: ExecutionSection,
    pub total_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

struct Failure {
    stage: OutcomeStage,
    error: PipelineError,
    sql_attempted: Option<String>,
    raw_model_text: Option<String>,
    token_cost: usize,
}

/// Sequences one request through
/// prompt → generate → validate → execute → record → respond.
///
/// Every terminal path, success or failure, writes exactly one
/// conversation record before the response leaves this type.
pub struct Pipeline {
    llm: LlmManager,
    executor: Box<dyn QueryExecutor>,
    audit: AuditRecorder,
    snapshot: Arc<SchemaSnapshot>,
    guard_config: GuardConfig,
    standard_timeout: Duration,
    long_timeout: Duration,
    pub metrics: PipelineMetrics,
}

impl Pipeline {
    pub fn new(
        llm: LlmManager,
        executor: Box<dyn QueryExecutor>,
        audit: AuditRecorder,
        snapshot: Arc<SchemaSnapshot>,
        guard_config: GuardConfig,
        standard_timeout: Duration,
        long_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            executor,
            audit,
            snapshot,
            guard_config,
            standard_timeout,
            long_timeout,
            metrics: PipelineMetrics::default(),
        }
    }

    pub async fn handle(&self, request: QueryRequest) -> AgentResponse {
        let started = Instant::now();
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);

        // PROMPTED
        let prompt_text = prompt::compose(
            request.tenant_id,
            &request.question,
            request.analysis_type,
            &self.snapshot,
        );
        let mut token_cost = approx_tokens(&prompt_text);

        // GENERATED
        let raw = match self.llm.complete(&prompt_text).await {
            Ok(raw) => raw,
            Err(error) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                return self
                    .fail(
                        &request,
                        started,
                        Failure {
                            stage: OutcomeStage::GenerationFailed,
                            error,
                            sql_attempted: None,
                            raw_model_text: None,
                            token_cost,
                        },
                    )
                    .await;
            }
        };
        token_cost += approx_tokens(&raw);

        let generated = match models::parse_generated(&raw) {
            Ok(generated) => generated,
            Err(failure) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                let error = match failure {
                    ContractFailure::NoJsonObject => {
                        PipelineError::Parse("model reply held no JSON object".to_string())
                    }
                    ContractFailure::FieldMismatch(msg) => PipelineError::Contract(msg),
                };
                return self
                    .fail(
                        &request,
                        started,
                        Failure {
                            stage: OutcomeStage::GenerationFailed,
                            error,
                            sql_attempted: None,
                            raw_model_text: Some(raw),
                            token_cost,
                        },
                    )
                    .await;
            }
        };

        // VALIDATED
        let validation = guard::validate(
            &generated.sql,
            request.tenant_id,
            &self.snapshot,
            &self.guard_config,
        );
        if !validation.accepted {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                tenant_id = request.tenant_id,
                "guard rejected generated query: {:?}", validation.violations
            );
            return self
                .fail(
                    &request,
                    started,
                    Failure {
                        stage: OutcomeStage::ValidationFailed,
                        error: PipelineError::Rejected(validation.violations),
                        sql_attempted: Some(generated.sql.clone()),
                        raw_model_text: Some(raw),
                        token_cost,
                    },
                )
                .await;
        }
        let final_sql = validation
            .rewritten_sql
            .unwrap_or_else(|| generated.sql.clone());
        let timeout = match validation.timeout_class {
            TimeoutClass::Standard => self.standard_timeout,
            TimeoutClass::Long => self.long_timeout,
        };

        // EXECUTED
        let outcome = match self.executor.execute(&final_sql, timeout).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                return self
                    .fail(
                        &request,
                        started,
                        Failure {
                            stage: OutcomeStage::ExecutionFailed,
                            error,
                            sql_attempted: Some(final_sql),
                            raw_model_text: Some(raw),
                            token_cost,
                        },
                    )
                    .await;
            }
        };
        self.metrics.executed.fetch_add(1, Ordering::Relaxed);
        info!(
            tenant_id = request.tenant_id,
            rows = outcome.row_count,
            duration_ms = outcome.duration_ms,
            "query executed"
        );

        // RECORDED
        let record = ConversationRecord {
            tenant_id: request.tenant_id,
            question: request.question.clone(),
            outcome_stage: OutcomeStage::Completed,
            sql_attempted: Some(final_sql.clone()),
            raw_model_text: None,
            violations: Vec::new(),
            execution: Some(outcome.clone()),
            error_detail: None,
            approximate_token_cost: token_cost,
            timestamp_utc: chrono::Utc::now(),
        };
        self.audit.record(&record).await;

        // RESPONDED
        AgentResponse {
            success: true,
            question: request.question,
            sql: Some(SqlSection {
                query: final_sql,
                explanation: generated.explanation,
                columns: generated.columns,
                complexity: generated.complexity,
                estimated_time: generated.estimated_time,
            }),
            execution: ExecutionSection {
                executed: true,
                result: Some(serde_json::Value::Array(outcome.rows)),
                error: None,
                row_count: outcome.row_count,
            },
            total_time_ms: started.elapsed().as_millis() as u64,
            error: None,
            message: None,
        }
    }

    async fn fail(&self, request: &QueryRequest, started: Instant, failure: Failure) -> AgentResponse {
        let record = ConversationRecord {
            tenant_id: request.tenant_id,
            question: request.question.clone(),
            outcome_stage: failure.stage,
            sql_attempted: failure.sql_attempted,
            raw_model_text: failure.raw_model_text,
            violations: failure.error.violations().to_vec(),
            execution: None,
            error_detail: Some(failure.error.to_string()),
            approximate_token_cost: failure.token_cost,
            timestamp_utc: chrono::Utc::now(),
        };
        self.audit.record(&record).await;

        let executed_stage = failure.stage == OutcomeStage::ExecutionFailed;
        AgentResponse {
            success: false,
            question: request.question.clone(),
            sql: None,
            execution: ExecutionSection {
                executed: false,
                result: None,
                error: executed_stage.then(|| failure.error.public_message().to_string()),
                row_count: 0,
            },
            total_time_ms: started.elapsed().as_millis() as u64,
            error: Some(failure.error.code().to_string()),
            message: Some(failure.error.public_message().to_string()),
        }
    }
}

/// Rough chars/4 heuristic, good enough for cost trending in the audit log.
fn approx_tokens(text: &str) -> usize {
    text.len() / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::executor::ExecutionOutcome;
    use crate::llm::{CompletionBackend, LlmError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedBackend {
        reply: String,
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.reply.clone())
        }
    }

    struct CountingExecutor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueryExecutor for CountingExecutor {
        async fn execute(
            &self,
            _sql: &str,
            _timeout: Duration,
        ) -> Result<ExecutionOutcome, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionOutcome {
                columns: vec!["real_r".to_string()],
                rows: vec![serde_json::json!({"real_r": 1520.5})],
                row_count: 1,
                duration_ms: 2,
            })
        }
    }

    fn snapshot() -> Arc<SchemaSnapshot> {
        Arc::new(
            SchemaSnapshot::from_json(
                r#"{
                    "version": "test",
                    "description": "",
                    "tenant_column": "bar_id",
                    "tables": [{"name": "eventos_base", "tenant_scoped": true}]
                }"#,
            )
            .unwrap(),
        )
    }

    fn contract_reply(sql: &str) -> String {
        serde_json::json!({
            "sql": sql,
            "explanation": "test query",
            "columns": ["real_r"],
            "metrics": ["faturamento"],
            "complexity": "low",
            "estimated_time": "fast"
        })
        .to_string()
    }

    struct Fixture {
        pipeline: Pipeline,
        executor_calls: Arc<AtomicUsize>,
        audit_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture(reply: String) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let executor_calls = Arc::new(AtomicUsize::new(0));

        let llm = LlmManager::with_backend(
            Box::new(ScriptedBackend { reply }),
            2,
            Duration::from_millis(200),
        );
        let pipeline = Pipeline::new(
            llm,
            Box::new(CountingExecutor {
                calls: Arc::clone(&executor_calls),
            }),
            AuditRecorder::new(&audit_path, Duration::from_secs(1)),
            snapshot(),
            GuardConfig::default(),
            Duration::from_secs(5),
            Duration::from_secs(20),
        );
        Fixture {
            pipeline,
            executor_calls,
            audit_path,
            _dir: dir,
        }
    }

    fn request() -> QueryRequest {
        QueryRequest {
            tenant_id: 3,
            question: "faturamento de ontem".to_string(),
            analysis_type: AnalysisType::Query,
        }
    }

    fn audit_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn scoped_query_flows_through_to_execution() {
        let fx = fixture(contract_reply(
            "SELECT real_r FROM eventos_base WHERE bar_id = 3",
        ));
        let response = fx.pipeline.handle(request()).await;

        assert!(response.success);
        assert_eq!(fx.executor_calls.load(Ordering::SeqCst), 1);
        let sql = response.sql.unwrap();
        assert!(sql.query.contains("LIMIT 100"), "sent: {}", sql.query);
        assert_eq!(response.execution.row_count, 1);

        let records = audit_lines(&fx.audit_path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["outcome_stage"], "completed");
    }

    #[tokio::test]
    async fn guard_rejection_never_reaches_the_executor() {
        let fx = fixture(contract_reply("SELECT * FROM eventos_base"));
        let response = fx.pipeline.handle(request()).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("TenantScopeViolation"));
        assert_eq!(fx.executor_calls.load(Ordering::SeqCst), 0);
        // The candidate SQL stays out of the response entirely.
        assert!(response.sql.is_none());

        let records = audit_lines(&fx.audit_path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["outcome_stage"], "validation_failed");
        assert_eq!(records[0]["sql_attempted"], "SELECT * FROM eventos_base");
    }

    #[tokio::test]
    async fn write_attempt_is_refused_before_any_database_call() {
        let fx = fixture(contract_reply("DELETE FROM eventos_base WHERE bar_id = 3"));
        let response = fx.pipeline.handle(request()).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("WriteAttempt"));
        assert_eq!(fx.executor_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_json_reply_is_a_parse_error_and_still_audited() {
        let fx = fixture("I am sorry, I cannot help with that.".to_string());
        let response = fx.pipeline.handle(request()).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("ParseError"));
        assert_eq!(fx.executor_calls.load(Ordering::SeqCst), 0);

        let records = audit_lines(&fx.audit_path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tenant_id"], 3);
        assert_eq!(
            records[0]["raw_model_text"],
            "I am sorry, I cannot help with that."
        );
    }

    #[tokio::test]
    async fn contract_mismatch_is_distinguished_from_parse_failure() {
        let fx = fixture(r#"{"sql": "SELECT 1", "explanation": "partial"}"#.to_string());
        let response = fx.pipeline.handle(request()).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("ContractViolation"));
    }

    struct TimingOutExecutor;

    #[async_trait]
    impl QueryExecutor for TimingOutExecutor {
        async fn execute(
            &self,
            _sql: &str,
            _timeout: Duration,
        ) -> Result<ExecutionOutcome, PipelineError> {
            Err(PipelineError::Timeout)
        }
    }

    #[tokio::test]
    async fn execution_timeout_surfaces_its_code_and_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let llm = LlmManager::with_backend(
            Box::new(ScriptedBackend {
                reply: contract_reply("SELECT real_r FROM eventos_base WHERE bar_id = 3"),
            }),
            2,
            Duration::from_millis(200),
        );
        let pipeline = Pipeline::new(
            llm,
            Box::new(TimingOutExecutor),
            AuditRecorder::new(&audit_path, Duration::from_secs(1)),
            snapshot(),
            GuardConfig::default(),
            Duration::from_secs(5),
            Duration::from_secs(20),
        );

        let response = pipeline.handle(request()).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("TimeoutError"));
        assert!(response.execution.error.is_some());

        let records = audit_lines(&audit_path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["outcome_stage"], "execution_failed");
        assert_eq!(
            records[0]["sql_attempted"],
            "SELECT real_r FROM eventos_base WHERE bar_id = 3 LIMIT 100"
        );
    }

    #[tokio::test]
    async fn metrics_count_every_path() {
        let fx = fixture(contract_reply(
            "SELECT real_r FROM eventos_base WHERE bar_id = 3",
        ));
        fx.pipeline.handle(request()).await;
        fx.pipeline.handle(request()).await;

        let metrics = fx.pipeline.metrics.snapshot();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.executed, 2);
        assert_eq!(metrics.rejected, 0);
    }
}
