use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::llm::models::AnalysisType;
use crate::pipeline::{MetricsSnapshot, QueryRequest};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertSqlRequest {
    pub tenant_id: i64,
    pub question_text: String,
    #[serde(default)]
    pub analysis_type: AnalysisType,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub catalog_version: String,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct CatalogInfo {
    pub version: String,
    pub tenant_column: String,
    pub tables: Vec<String>,
}

/// The one endpoint that matters: question in, guarded query result out.
pub async fn expert_sql(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExpertSqlRequest>,
) -> Response {
    if payload.tenant_id <= 0 {
        return bad_request("tenantId must be a positive integer");
    }
    if payload.question_text.trim().is_empty() {
        return bad_request("questionText must not be empty");
    }

    debug!(
        tenant_id = payload.tenant_id,
        "expert-sql question: {}", payload.question_text
    );

    let response = state
        .pipeline
        .handle(QueryRequest {
            tenant_id: payload.tenant_id,
            question: payload.question_text,
            analysis_type: payload.analysis_type,
        })
        .await;

    let status = status_for(response.error.as_deref());
    (status, Json(response)).into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "error": "BadRequest",
            "message": message,
        })),
    )
        .into_response()
}

/// Maps taxonomy codes onto HTTP statuses. Guard rejections are the
/// caller's problem (the question led to an unsafe query), upstream and
/// database trouble is ours.
fn status_for(code: Option<&str>) -> StatusCode {
    match code {
        None => StatusCode::OK,
        Some("WriteAttempt" | "MultiStatementAttempt" | "ForbiddenConstruct"
            | "TenantScopeViolation") => StatusCode::UNPROCESSABLE_ENTITY,
        Some("ParseError" | "ContractViolation" | "UpstreamError") => StatusCode::BAD_GATEWAY,
        Some("TimeoutError") => StatusCode::GATEWAY_TIMEOUT,
        Some("PoolExhausted") => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        catalog_version: state.snapshot.version.clone(),
        metrics: state.pipeline.metrics.snapshot(),
    })
}

pub async fn catalog_info(State(state): State<Arc<AppState>>) -> Json<CatalogInfo> {
    Json(CatalogInfo {
        version: state.snapshot.version.clone(),
        tenant_column: state.snapshot.tenant_column.clone(),
        tables: state.snapshot.table_names(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejections_map_to_unprocessable_entity() {
        assert_eq!(
            status_for(Some("TenantScopeViolation")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(Some("WriteAttempt")), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn infrastructure_failures_map_to_5xx() {
        assert_eq!(status_for(Some("UpstreamError")), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(Some("TimeoutError")), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(Some("PoolExhausted")), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(Some("ExecutionError")), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn success_is_ok() {
        assert_eq!(status_for(None), StatusCode::OK);
    }
}
