use crate::db::db_pool::ReadOnlyConnectionManager;
use crate::error::PipelineError;
use async_trait::async_trait;
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::Connection;
use r2d2::Pool;
use serde::Serialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub duration_ms: u64,
}

/// Runs one guard-accepted statement and nothing else. The trait seam is
/// what lets orchestrator tests prove the executor is never reached when
/// the guard rejects.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, PipelineError>;
}

pub struct DuckDbExecutor {
    pool: Pool<ReadOnlyConnectionManager>,
}

impl DuckDbExecutor {
    pub fn new(pool: Pool<ReadOnlyConnectionManager>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryExecutor for DuckDbExecutor {
    async fn execute(
        &self,
        sql: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let pool = self.pool.clone();
        let sql = sql.to_string();

        let task = tokio::task::spawn_blocking(move || -> Result<ExecutionOutcome, PipelineError> {
            let started = Instant::now();
            let conn = pool.get().map_err(|e| {
                warn!("read-only pool acquisition failed: {}", e);
                PipelineError::PoolExhausted
            })?;
            let (columns, rows) = run_single_statement(&conn, &sql)
                .map_err(|e| PipelineError::Execution(e.to_string()))?;
            Ok(ExecutionOutcome {
                row_count: rows.len(),
                columns,
                rows,
                duration_ms: started.elapsed().as_millis() as u64,
            })
        });

        match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                warn!("query exceeded its {}ms budget, abandoning it", timeout.as_millis());
                Err(PipelineError::Timeout)
            }
            Ok(Err(join_err)) => Err(PipelineError::Execution(format!(
                "executor task failed: {}",
                join_err
            ))),
            Ok(Ok(result)) => result,
        }
    }
}

fn run_single_statement(
    conn: &Connection,
    sql: &str,
) -> duckdb::Result<(Vec<String>, Vec<serde_json::Value>)> {
    let mut stmt = conn.prepare(sql)?;

    let column_count = stmt.column_count();
    let mut columns = Vec::with_capacity(column_count);
    for i in 0..column_count {
        match stmt.column_name(i) {
            Ok(name) => columns.push(name.to_string()),
            Err(_) => columns.push(format!("column_{}", i)),
        }
    }

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = serde_json::Map::with_capacity(column_count);
        for (i, name) in columns.iter().enumerate() {
            let value = match row.get_ref(i) {
                Ok(value_ref) => value_ref_to_json(value_ref),
                Err(_) => serde_json::Value::Null,
            };
            object.insert(name.clone(), value);
        }
        out.push(serde_json::Value::Object(object));
    }

    Ok((columns, out))
}

fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Boolean(v) => json!(v),
        ValueRef::TinyInt(v) => json!(v),
        ValueRef::SmallInt(v) => json!(v),
        ValueRef::Int(v) => json!(v),
        ValueRef::BigInt(v) => json!(v),
        ValueRef::HugeInt(v) => serde_json::Value::String(v.to_string()),
        ValueRef::UTinyInt(v) => json!(v),
        ValueRef::USmallInt(v) => json!(v),
        ValueRef::UInt(v) => json!(v),
        ValueRef::UBigInt(v) => json!(v),
        ValueRef::Float(v) => json!(v),
        ValueRef::Double(v) => json!(v),
        ValueRef::Decimal(v) => serde_json::Value::String(v.to_string()),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} byte blob>", bytes.len())),
        ValueRef::Date32(days) => match epoch_date(days) {
            Some(date) => serde_json::Value::String(date.format("%Y-%m-%d").to_string()),
            None => json!(days),
        },
        ValueRef::Timestamp(unit, raw) => match timestamp_micros(unit, raw)
            .and_then(chrono::DateTime::from_timestamp_micros)
        {
            Some(ts) => serde_json::Value::String(ts.to_rfc3339()),
            None => json!(raw),
        },
        other => serde_json::Value::String(format!("{:?}", other)),
    }
}

fn epoch_date(days: i32) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::from_ymd_opt(1970, 1, 1)?
        .checked_add_signed(chrono::Duration::days(days as i64))
}

fn timestamp_micros(unit: TimeUnit, raw: i64) -> Option<i64> {
    match unit {
        TimeUnit::Second => raw.checked_mul(1_000_000),
        TimeUnit::Millisecond => raw.checked_mul(1_000),
        TimeUnit::Microsecond => Some(raw),
        TimeUnit::Nanosecond => Some(raw / 1_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("fixture.duckdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE eventos_base (bar_id BIGINT, real_r DOUBLE, data_evento DATE);
             INSERT INTO eventos_base VALUES
                 (3, 1520.50, DATE '2024-07-01'),
                 (3, 980.00, DATE '2024-07-02'),
                 (4, 77.00, DATE '2024-07-01');",
        )
        .unwrap();
        drop(conn);
        path.to_string_lossy().to_string()
    }

    fn executor(db_path: String) -> DuckDbExecutor {
        let manager = ReadOnlyConnectionManager::new(db_path);
        let pool = Pool::builder()
            .max_size(2)
            .connection_timeout(Duration::from_millis(500))
            .build(manager)
            .unwrap();
        DuckDbExecutor::new(pool)
    }

    #[tokio::test]
    async fn returns_rows_as_json_objects() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(seeded_db(&dir));

        let outcome = exec
            .execute(
                "SELECT bar_id, real_r FROM eventos_base WHERE bar_id = 3 ORDER BY real_r LIMIT 10",
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.columns, vec!["bar_id", "real_r"]);
        assert_eq!(outcome.rows[0]["real_r"], json!(980.0));
    }

    #[tokio::test]
    async fn read_only_role_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(seeded_db(&dir));

        let err = exec
            .execute(
                "INSERT INTO eventos_base VALUES (3, 1.0, DATE '2024-07-03')",
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ExecutionError");
    }

    #[tokio::test]
    async fn unknown_column_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(seeded_db(&dir));

        let err = exec
            .execute(
                "SELECT no_such_column FROM eventos_base WHERE bar_id = 3",
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ExecutionError");
    }
}
