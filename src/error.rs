use serde::Serialize;
use std::error::Error;
use std::fmt;

/// A single rule the guard found broken in a candidate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationKind {
    WriteAttempt,
    MultiStatementAttempt,
    ForbiddenConstruct,
    TenantScopeViolation,
}

impl ViolationKind {
    pub fn code(&self) -> &'static str {
        match self {
            ViolationKind::WriteAttempt => "WriteAttempt",
            ViolationKind::MultiStatementAttempt => "MultiStatementAttempt",
            ViolationKind::ForbiddenConstruct => "ForbiddenConstruct",
            ViolationKind::TenantScopeViolation => "TenantScopeViolation",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.detail)
    }
}

/// Terminal failure of a request, one variant per taxonomy code.
///
/// The `Display` impl carries internal detail for logs and audit records.
/// Callers only ever see `code()` and `public_message()`.
#[derive(Debug)]
pub enum PipelineError {
    /// Model reply contained no well-formed JSON object.
    Parse(String),
    /// Model endpoint unreachable, timed out, or saturated.
    Upstream(String),
    /// Model reply parsed as JSON but did not match the output contract.
    Contract(String),
    /// Guard refused the candidate SQL.
    Rejected(Vec<Violation>),
    /// Database query exceeded its time budget.
    Timeout,
    /// Database refused or failed the validated query.
    Execution(String),
    /// No read-only connection became available within the wait budget.
    PoolExhausted,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Parse(_) => "ParseError",
            PipelineError::Upstream(_) => "UpstreamError",
            PipelineError::Contract(_) => "ContractViolation",
            PipelineError::Rejected(violations) => violations
                .first()
                .map(|v| v.kind.code())
                .unwrap_or("ForbiddenConstruct"),
            PipelineError::Timeout => "TimeoutError",
            PipelineError::Execution(_) => "ExecutionError",
            PipelineError::PoolExhausted => "PoolExhausted",
        }
    }

    /// User-safe message. Never includes SQL text, raw model output or
    /// database errors; those stay in the audit record.
    pub fn public_message(&self) -> &'static str {
        match self {
            PipelineError::Parse(_) => "The assistant could not produce a usable query for this question.",
            PipelineError::Upstream(_) => "The language model service is unavailable right now.",
            PipelineError::Contract(_) => "The assistant returned an incomplete answer.",
            PipelineError::Rejected(_) => "The generated query was blocked by the safety validator.",
            PipelineError::Timeout => "The query took too long and was cancelled.",
            PipelineError::Execution(_) => "The query could not be executed.",
            PipelineError::PoolExhausted => "The service is at capacity, try again shortly.",
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            PipelineError::Rejected(v) => v,
            _ => &[],
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Parse(msg) => write!(f, "no JSON object in model reply: {}", msg),
            PipelineError::Upstream(msg) => write!(f, "model endpoint error: {}", msg),
            PipelineError::Contract(msg) => write!(f, "model reply broke the output contract: {}", msg),
            PipelineError::Rejected(violations) => {
                let joined = violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                write!(f, "query rejected: {}", joined)
            }
            PipelineError::Timeout => write!(f, "query execution timed out"),
            PipelineError::Execution(msg) => write!(f, "query execution failed: {}", msg),
            PipelineError::PoolExhausted => write!(f, "read-only connection pool exhausted"),
        }
    }
}

impl Error for PipelineError {}
