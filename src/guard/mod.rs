pub mod analysis;

use crate::catalog::SchemaSnapshot;
use crate::error::{Violation, ViolationKind};
use regex::Regex;
use serde::Deserialize;
use sqlparser::ast::{Expr, Query, Statement, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Functions a generated query may call. Everything else is rejected, so
/// sleep/delay, file and network readers never need enumerating.
const DEFAULT_ALLOWED_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "median",
    "stddev",
    "variance",
    "coalesce",
    "nullif",
    "ifnull",
    "greatest",
    "least",
    "round",
    "floor",
    "ceil",
    "ceiling",
    "abs",
    "lower",
    "upper",
    "trim",
    "ltrim",
    "rtrim",
    "length",
    "substr",
    "substring",
    "concat",
    "replace",
    "strftime",
    "date_trunc",
    "date_part",
    "date_diff",
    "datediff",
    "date_add",
    "last_day",
    "year",
    "month",
    "day",
    "current_date",
    "current_timestamp",
    "now",
    "today",
    "row_number",
    "rank",
    "dense_rank",
    "lag",
    "lead",
    "string_agg",
    "array_agg",
];

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GuardConfig {
    /// LIMIT injected into row-returning queries that lack one.
    pub default_limit: u64,
    /// Hard cap; larger requested limits are clamped down to this.
    pub max_limit: u64,
    /// Joins/subqueries/CTEs above this count select the long timeout.
    pub complexity_threshold: usize,
    /// Extends the built-in function allowlist.
    pub extra_allowed_functions: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1_000,
            complexity_threshold: 4,
            extra_allowed_functions: Vec::new(),
        }
    }
}

impl GuardConfig {
    pub fn allowed_functions(&self) -> HashSet<String> {
        DEFAULT_ALLOWED_FUNCTIONS
            .iter()
            .map(|f| f.to_string())
            .chain(
                self.extra_allowed_functions
                    .iter()
                    .map(|f| f.to_lowercase()),
            )
            .collect()
    }
}

/// Which execution time budget the orchestrator should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Standard,
    Long,
}

#[derive(Debug)]
pub struct ValidationResult {
    pub accepted: bool,
    /// The SQL actually sent to the executor when accepted. May differ
    /// from the candidate (LIMIT injection/clamping); re-validating it
    /// yields the same text back.
    pub rewritten_sql: Option<String>,
    pub violations: Vec<Violation>,
    pub timeout_class: TimeoutClass,
}

impl ValidationResult {
    fn rejected(violations: Vec<Violation>) -> Self {
        Self {
            accepted: false,
            rewritten_sql: None,
            violations,
            timeout_class: TimeoutClass::Standard,
        }
    }

    fn rejected_with(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self::rejected(vec![Violation::new(kind, detail)])
    }
}

/// Statically validates (and possibly rewrites) a candidate query.
///
/// Pure: derives everything from the SQL text, the caller's tenant id and
/// the catalog snapshot. Never contacts the database and never trusts the
/// model's explanation of what the query does.
pub fn validate(
    sql: &str,
    tenant_id: i64,
    snapshot: &SchemaSnapshot,
    config: &GuardConfig,
) -> ValidationResult {
    // 1. Statement kind, lexically, before any parsing.
    let Some(keyword) = leading_keyword(sql) else {
        return ValidationResult::rejected_with(ViolationKind::ForbiddenConstruct, "empty statement");
    };
    if keyword != "SELECT" && keyword != "WITH" {
        return ValidationResult::rejected_with(
            ViolationKind::WriteAttempt,
            format!("statement begins with {}", keyword),
        );
    }

    let mut statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            // Fail closed: SQL the guard cannot parse is SQL it cannot vouch for.
            return ValidationResult::rejected_with(
                ViolationKind::ForbiddenConstruct,
                format!("statement could not be parsed: {}", e),
            );
        }
    };

    // 2. Exactly one top-level statement.
    if statements.len() != 1 {
        return ValidationResult::rejected_with(
            ViolationKind::MultiStatementAttempt,
            format!("{} top-level statements", statements.len()),
        );
    }
    let statement = &mut statements[0];

    // A WITH chain ending in anything but SELECT surfaces here.
    let Statement::Query(query) = statement else {
        return ValidationResult::rejected_with(
            ViolationKind::WriteAttempt,
            "statement is not a read-only query",
        );
    };

    // 3 + 4. One structural walk covers forbidden constructs and tenant scope.
    let scoped_tables = snapshot.tenant_scoped_tables();
    let allowed_functions = config.allowed_functions();
    let analysis = analysis::analyze(
        query,
        tenant_id,
        &snapshot.tenant_column,
        &scoped_tables,
        &allowed_functions,
    );
    if !analysis.violations.is_empty() {
        // Forbidden constructs outrank the other findings, matching check order.
        let (forbidden, rest): (Vec<_>, Vec<_>) = analysis
            .violations
            .into_iter()
            .partition(|v| v.kind == ViolationKind::ForbiddenConstruct);
        return ValidationResult::rejected(if forbidden.is_empty() { rest } else { forbidden });
    }

    // 5. Resource bound: inject or clamp LIMIT.
    apply_limit(query, config);

    // 6. Complexity only picks the timeout budget, it never rejects.
    let timeout_class = if analysis.complexity > config.complexity_threshold {
        TimeoutClass::Long
    } else {
        TimeoutClass::Standard
    };

    ValidationResult {
        accepted: true,
        rewritten_sql: Some(statement.to_string()),
        violations: Vec::new(),
        timeout_class,
    }
}

/// First keyword of the statement after stripping comments and whitespace.
fn leading_keyword(sql: &str) -> Option<String> {
    static BLOCK_COMMENTS: OnceLock<Regex> = OnceLock::new();
    static LINE_COMMENTS: OnceLock<Regex> = OnceLock::new();
    let block = BLOCK_COMMENTS.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
    let line = LINE_COMMENTS.get_or_init(|| Regex::new(r"--[^\n]*").unwrap());

    let without_blocks = block.replace_all(sql, " ");
    let stripped = line.replace_all(&without_blocks, " ");
    let token: String = stripped
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(token.to_uppercase())
    }
}

fn apply_limit(query: &mut Query, config: &GuardConfig) {
    let rewrite = match &query.limit {
        None => Some(config.default_limit),
        Some(Expr::Value(Value::Number(text, _))) => match text.parse::<u64>() {
            Ok(requested) if requested <= config.max_limit => None,
            _ => Some(config.max_limit),
        },
        // Computed LIMIT expressions are clamped rather than trusted.
        Some(_) => Some(config.max_limit),
    };
    if let Some(value) = rewrite {
        query.limit = Some(limit_expr(value));
    }
}

fn limit_expr(value: u64) -> Expr {
    Expr::Value(Value::Number(value.to_string(), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaSnapshot;

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot::from_json(
            r#"{
                "version": "test",
                "description": "",
                "tenant_column": "bar_id",
                "tables": [
                    {"name": "eventos_base", "tenant_scoped": true},
                    {"name": "pagamentos", "tenant_scoped": true},
                    {"name": "feriados", "tenant_scoped": false}
                ]
            }"#,
        )
        .unwrap()
    }

    fn run(sql: &str) -> ValidationResult {
        validate(sql, 3, &snapshot(), &GuardConfig::default())
    }

    fn first_kind(result: &ValidationResult) -> ViolationKind {
        result.violations[0].kind
    }

    #[test]
    fn accepts_scoped_select_and_injects_limit() {
        let result = run(
            "SELECT real_r FROM eventos_base WHERE bar_id = 3 AND data_evento = CURRENT_DATE - 1",
        );
        assert!(result.accepted, "violations: {:?}", result.violations);
        let sql = result.rewritten_sql.unwrap();
        assert!(sql.contains("LIMIT 100"), "rewritten: {}", sql);
    }

    #[test]
    fn rejects_delete_as_write_attempt() {
        let result = run("DELETE FROM eventos_base WHERE bar_id = 3");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::WriteAttempt);
    }

    #[test]
    fn rejects_insert_update_drop_and_friends() {
        for sql in [
            "INSERT INTO eventos_base VALUES (1)",
            "UPDATE eventos_base SET real_r = 0 WHERE bar_id = 3",
            "DROP TABLE eventos_base",
            "CREATE TABLE x (a INT)",
            "GRANT SELECT ON eventos_base TO public",
            "TRUNCATE TABLE eventos_base",
            "COPY eventos_base TO 'out.csv'",
            "CALL something()",
        ] {
            let result = run(sql);
            assert!(!result.accepted, "accepted: {}", sql);
            assert_eq!(first_kind(&result), ViolationKind::WriteAttempt, "{}", sql);
        }
    }

    #[test]
    fn select_into_is_a_write_attempt() {
        let result = run("SELECT * INTO copia FROM eventos_base WHERE bar_id = 3");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::WriteAttempt);
    }

    #[test]
    fn locking_clause_is_forbidden() {
        let result = run("SELECT * FROM eventos_base WHERE bar_id = 3 FOR UPDATE");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::ForbiddenConstruct);
    }

    #[test]
    fn rejects_statement_smuggled_behind_semicolon() {
        let result = run("SELECT 1; DROP TABLE eventos_base;");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::MultiStatementAttempt);
    }

    #[test]
    fn trailing_semicolon_is_not_a_second_statement() {
        let result = run("SELECT real_r FROM eventos_base WHERE bar_id = 3;");
        assert!(result.accepted, "violations: {:?}", result.violations);
    }

    #[test]
    fn write_hidden_behind_leading_comment_is_still_a_write() {
        let result = run("/* harmless */ DELETE FROM eventos_base WHERE bar_id = 3");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::WriteAttempt);
    }

    #[test]
    fn rejects_missing_tenant_predicate() {
        let result = run("SELECT * FROM eventos_base");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::TenantScopeViolation);
    }

    #[test]
    fn rejects_binding_to_a_different_tenant() {
        let result = run("SELECT * FROM eventos_base WHERE bar_id = 4");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::TenantScopeViolation);
        assert!(result.violations[0].detail.contains("literal 4"));
    }

    #[test]
    fn tenant_predicate_inside_or_branch_does_not_count() {
        let result = run("SELECT * FROM eventos_base WHERE bar_id = 3 OR valor > 100");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::TenantScopeViolation);
    }

    #[test]
    fn comment_claiming_a_filter_does_not_count() {
        let result = run("SELECT * FROM eventos_base /* bar_id = 3 */");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::TenantScopeViolation);
    }

    #[test]
    fn casing_does_not_bypass_the_scope_check() {
        let result = run("select REAL_R from EVENTOS_BASE where BAR_ID = 3");
        assert!(result.accepted, "violations: {:?}", result.violations);
    }

    #[test]
    fn computed_tenant_binding_fails_closed() {
        let result = run("SELECT * FROM eventos_base WHERE bar_id = 2 + 1");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::TenantScopeViolation);
    }

    #[test]
    fn every_scoped_table_in_a_join_needs_its_own_binding() {
        let missing_one = run(
            "SELECT e.real_r FROM eventos_base e \
             JOIN pagamentos p ON e.evento_id = p.evento_id \
             WHERE e.bar_id = 3",
        );
        assert!(!missing_one.accepted);
        assert_eq!(first_kind(&missing_one), ViolationKind::TenantScopeViolation);

        let both_bound = run(
            "SELECT e.real_r FROM eventos_base e \
             JOIN pagamentos p ON e.evento_id = p.evento_id AND p.bar_id = 3 \
             WHERE e.bar_id = 3",
        );
        assert!(both_bound.accepted, "violations: {:?}", both_bound.violations);
    }

    #[test]
    fn unscoped_reference_table_needs_no_binding() {
        let result = run(
            "SELECT e.real_r FROM eventos_base e \
             JOIN feriados f ON e.data_evento = f.data \
             WHERE e.bar_id = 3",
        );
        assert!(result.accepted, "violations: {:?}", result.violations);
    }

    #[test]
    fn scoped_table_inside_subquery_is_checked() {
        let result = run(
            "SELECT * FROM (SELECT real_r FROM eventos_base) t WHERE 1 = 1",
        );
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::TenantScopeViolation);
    }

    #[test]
    fn scoped_table_inside_cte_is_checked_and_cte_name_is_not_scoped() {
        let result = run(
            "WITH vendas AS (SELECT real_r FROM eventos_base WHERE bar_id = 3) \
             SELECT * FROM vendas",
        );
        assert!(result.accepted, "violations: {:?}", result.violations);

        let unbound = run(
            "WITH vendas AS (SELECT real_r FROM eventos_base) SELECT * FROM vendas",
        );
        assert!(!unbound.accepted);
        assert_eq!(first_kind(&unbound), ViolationKind::TenantScopeViolation);
    }

    #[test]
    fn rejects_system_catalog_references() {
        for sql in [
            "SELECT * FROM information_schema.tables",
            "SELECT * FROM pg_catalog.pg_tables",
            "SELECT name FROM sqlite_master",
            "SELECT * FROM duckdb_settings",
        ] {
            let result = run(sql);
            assert!(!result.accepted, "accepted: {}", sql);
            assert_eq!(first_kind(&result), ViolationKind::ForbiddenConstruct, "{}", sql);
        }
    }

    #[test]
    fn rejects_functions_outside_the_allowlist() {
        let result = run("SELECT sleep(10) FROM eventos_base WHERE bar_id = 3");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::ForbiddenConstruct);

        let reader = run("SELECT * FROM read_csv('/etc/passwd')");
        assert!(!reader.accepted);
        assert_eq!(first_kind(&reader), ViolationKind::ForbiddenConstruct);
    }

    #[test]
    fn unparseable_sql_fails_closed() {
        let result = run("SELECT FROM WHERE ORDER LIMIT");
        assert!(!result.accepted);
        assert_eq!(first_kind(&result), ViolationKind::ForbiddenConstruct);
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let result = run("SELECT * FROM eventos_base WHERE bar_id = 3 LIMIT 999999");
        assert!(result.accepted);
        let sql = result.rewritten_sql.unwrap();
        assert!(sql.contains("LIMIT 1000"), "rewritten: {}", sql);
    }

    #[test]
    fn limit_within_cap_is_untouched() {
        let result = run("SELECT * FROM eventos_base WHERE bar_id = 3 LIMIT 50");
        assert!(result.accepted);
        assert!(result.rewritten_sql.unwrap().contains("LIMIT 50"));
    }

    #[test]
    fn validation_is_idempotent() {
        let first = run("SELECT real_r FROM eventos_base WHERE bar_id = 3");
        assert!(first.accepted);
        let rewritten = first.rewritten_sql.unwrap();

        let second = run(&rewritten);
        assert!(second.accepted);
        assert_eq!(second.rewritten_sql.unwrap(), rewritten);
    }

    #[test]
    fn complexity_above_threshold_selects_long_timeout() {
        let result = run(
            "WITH a AS (SELECT evento_id FROM eventos_base WHERE bar_id = 3), \
                  b AS (SELECT evento_id FROM pagamentos WHERE bar_id = 3) \
             SELECT * FROM a \
             JOIN b ON a.evento_id = b.evento_id \
             JOIN feriados f ON f.data = a.evento_id \
             WHERE a.evento_id IN (SELECT evento_id FROM pagamentos WHERE bar_id = 3)",
        );
        assert!(result.accepted, "violations: {:?}", result.violations);
        assert_eq!(result.timeout_class, TimeoutClass::Long);
    }

    #[test]
    fn simple_query_keeps_standard_timeout() {
        let result = run("SELECT real_r FROM eventos_base WHERE bar_id = 3");
        assert!(result.accepted);
        assert_eq!(result.timeout_class, TimeoutClass::Standard);
    }
}
