use crate::error::{Violation, ViolationKind};
use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, TableFactor, TableWithJoins,
    Value, WindowType,
};
use std::collections::HashSet;

/// Schemas and object prefixes the executor role must never see referenced.
const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "pg_catalog", "system", "temp"];
const SYSTEM_PREFIXES: &[&str] = &["duckdb_", "pg_", "sqlite_"];

/// Outcome of one structural walk over a parsed query.
pub struct Analysis {
    pub violations: Vec<Violation>,
    /// Joins + subqueries + CTEs + set operations, the guard's rough
    /// proxy for how long the query may run.
    pub complexity: usize,
}

/// Walks every scope of the query once, checking tenant bindings and the
/// function allowlist as it goes. The walk is the only source of truth;
/// no claim in the generated explanation is consulted.
pub fn analyze(
    query: &Query,
    tenant_id: i64,
    tenant_column: &str,
    scoped_tables: &HashSet<String>,
    allowed_functions: &HashSet<String>,
) -> Analysis {
    let mut walker = Walker {
        tenant_id,
        tenant_column: tenant_column.to_lowercase(),
        scoped_tables,
        allowed_functions,
        cte_scopes: Vec::new(),
        violations: Vec::new(),
        complexity: 0,
    };
    walker.walk_query(query);
    Analysis {
        violations: walker.violations,
        complexity: walker.complexity,
    }
}

/// One table reference inside a single SELECT scope.
struct TableRef {
    table: String,
    alias: Option<String>,
    scoped: bool,
}

impl TableRef {
    /// Whether a qualified column reference `qualifier.col` names this table.
    /// An alias, once given, replaces the table name as the only valid
    /// qualifier, mirroring SQL resolution rules.
    fn answers_to(&self, qualifier: &str) -> bool {
        match &self.alias {
            Some(alias) => alias == qualifier,
            None => self.table == qualifier,
        }
    }

    fn display_name(&self) -> &str {
        &self.table
    }
}

enum Binding {
    Correct,
    Wrong(String),
    Missing,
}

struct Walker<'a> {
    tenant_id: i64,
    tenant_column: String,
    scoped_tables: &'a HashSet<String>,
    allowed_functions: &'a HashSet<String>,
    /// One entry per WITH clause currently in scope; CTE names shadow
    /// base tables so they are never themselves scope-checked.
    cte_scopes: Vec<HashSet<String>>,
    violations: Vec<Violation>,
    complexity: usize,
}

impl<'a> Walker<'a> {
    fn forbidden(&mut self, detail: String) {
        self.violations
            .push(Violation::new(ViolationKind::ForbiddenConstruct, detail));
    }

    fn scope_violation(&mut self, detail: String) {
        self.violations
            .push(Violation::new(ViolationKind::TenantScopeViolation, detail));
    }

    fn cte_visible(&self, name: &str) -> bool {
        self.cte_scopes.iter().any(|scope| scope.contains(name))
    }

    fn walk_query(&mut self, query: &Query) {
        self.cte_scopes.push(HashSet::new());
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.complexity += 1;
                // A CTE body may reference CTEs declared before it.
                self.walk_query(&cte.query);
                if let Some(scope) = self.cte_scopes.last_mut() {
                    scope.insert(cte.alias.name.value.to_lowercase());
                }
            }
        }

        self.walk_set_expr(&query.body);

        for order in &query.order_by {
            self.walk_expr(&order.expr);
        }
        if let Some(limit) = &query.limit {
            self.walk_expr(limit);
        }
        for expr in &query.limit_by {
            self.walk_expr(expr);
        }
        if let Some(offset) = &query.offset {
            self.walk_expr(&offset.value);
        }
        if !query.locks.is_empty() || query.for_clause.is_some() {
            self.forbidden("locking or FOR clause not allowed".to_string());
        }
        self.cte_scopes.pop();
    }

    fn walk_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.walk_select(select),
            SetExpr::Query(query) => {
                self.complexity += 1;
                self.walk_query(query);
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.complexity += 1;
                self.walk_set_expr(left);
                self.walk_set_expr(right);
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.walk_expr(expr);
                    }
                }
            }
            other => self.forbidden(format!("query form not allowed: {}", other)),
        }
    }

    fn walk_select(&mut self, select: &Select) {
        // SELECT INTO creates a table; it parses as a query but is a write.
        if let Some(into) = &select.into {
            self.violations.push(Violation::new(
                ViolationKind::WriteAttempt,
                format!("SELECT INTO {}", into.name),
            ));
        }
        if !select.lateral_views.is_empty() {
            self.forbidden("lateral view not allowed".to_string());
        }

        let mut refs: Vec<TableRef> = Vec::new();
        let mut conjuncts: Vec<&Expr> = Vec::new();

        for table in &select.from {
            self.collect_table_refs(table, &mut refs, &mut conjuncts);
        }
        if let Some(selection) = &select.selection {
            collect_conjuncts(selection, &mut conjuncts);
        }

        self.check_tenant_scope(&refs, &conjuncts);

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.walk_expr(expr),
                SelectItem::ExprWithAlias { expr, .. } => self.walk_expr(expr),
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {}
            }
        }
        if let Some(selection) = &select.selection {
            self.walk_expr(selection);
        }
        if let GroupByExpr::Expressions(exprs) = &select.group_by {
            for expr in exprs {
                self.walk_expr(expr);
            }
        }
        if let Some(having) = &select.having {
            self.walk_expr(having);
        }
        if let Some(qualify) = &select.qualify {
            self.walk_expr(qualify);
        }
        for expr in &select.sort_by {
            self.walk_expr(expr);
        }
    }

    fn collect_table_refs<'e>(
        &mut self,
        table: &'e TableWithJoins,
        refs: &mut Vec<TableRef>,
        conjuncts: &mut Vec<&'e Expr>,
    ) {
        self.collect_factor(&table.relation, refs, conjuncts);
        for join in &table.joins {
            self.complexity += 1;
            self.collect_factor(&join.relation, refs, conjuncts);
            match &join.join_operator {
                JoinOperator::Inner(constraint)
                | JoinOperator::LeftOuter(constraint)
                | JoinOperator::RightOuter(constraint)
                | JoinOperator::FullOuter(constraint) => {
                    if let JoinConstraint::On(expr) = constraint {
                        // ON conjuncts may carry the tenant binding for the
                        // joined table, so they count toward the scope check.
                        collect_conjuncts(expr, conjuncts);
                        self.walk_expr(expr);
                    }
                }
                JoinOperator::CrossJoin => {}
                other => self.forbidden(format!("join type not allowed: {:?}", other)),
            }
        }
    }

    fn collect_factor<'e>(
        &mut self,
        factor: &'e TableFactor,
        refs: &mut Vec<TableRef>,
        conjuncts: &mut Vec<&'e Expr>,
    ) {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    self.forbidden(format!("table function not allowed: {}", name));
                    return;
                }
                if is_system_object(name) {
                    self.forbidden(format!("system object not allowed: {}", name));
                    return;
                }
                let table = name
                    .0
                    .last()
                    .map(|ident| ident.value.to_lowercase())
                    .unwrap_or_default();
                let qualified = name.0.len() > 1;
                let is_cte = !qualified && self.cte_visible(&table);
                refs.push(TableRef {
                    scoped: !is_cte && self.scoped_tables.contains(&table),
                    alias: alias.as_ref().map(|a| a.name.value.to_lowercase()),
                    table,
                });
            }
            TableFactor::Derived { subquery, .. } => {
                self.complexity += 1;
                self.walk_query(subquery);
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_table_refs(table_with_joins, refs, conjuncts);
            }
            other => self.forbidden(format!("table source not allowed: {}", other)),
        }
    }

    /// Every scoped table in this SELECT must have its own top-level
    /// equality binding to the caller's tenant id. Predicates inside OR
    /// branches never reach the conjunct list, so they cannot satisfy this.
    fn check_tenant_scope(&mut self, refs: &[TableRef], conjuncts: &[&Expr]) {
        let scoped: Vec<&TableRef> = refs.iter().filter(|r| r.scoped).collect();
        if scoped.is_empty() {
            return;
        }
        // An unqualified tenant column can only be credited when it
        // resolves unambiguously, i.e. one scoped table in the scope.
        let sole = scoped.len() == 1;
        for table in scoped {
            match self.find_binding(table, conjuncts, sole) {
                Binding::Correct => {}
                Binding::Wrong(found) => self.scope_violation(format!(
                    "table `{}` is bound to {} instead of tenant {}",
                    table.display_name(),
                    found,
                    self.tenant_id
                )),
                Binding::Missing => self.scope_violation(format!(
                    "table `{}` has no top-level `{} = {}` predicate",
                    table.display_name(),
                    self.tenant_column,
                    self.tenant_id
                )),
            }
        }
    }

    fn find_binding(&self, table: &TableRef, conjuncts: &[&Expr], sole: bool) -> Binding {
        let mut wrong: Option<String> = None;
        for conjunct in conjuncts {
            let Expr::BinaryOp { left, op, right } = unwrap_nested(conjunct) else {
                continue;
            };
            if *op != BinaryOperator::Eq {
                continue;
            }
            for (column_side, value_side) in [(left, right), (right, left)] {
                let Some(qualifier) = self.tenant_column_ref(column_side) else {
                    continue;
                };
                let applies = match &qualifier {
                    Some(q) => table.answers_to(q),
                    None => sole,
                };
                if !applies {
                    continue;
                }
                match literal_i64(value_side) {
                    Some(v) if v == self.tenant_id => return Binding::Correct,
                    Some(v) => wrong = Some(format!("literal {}", v)),
                    None => wrong = Some("a non-literal expression".to_string()),
                }
            }
        }
        match wrong {
            Some(found) => Binding::Wrong(found),
            None => Binding::Missing,
        }
    }

    /// Some(None) for a bare `bar_id`, Some(Some(qualifier)) for
    /// `e.bar_id`, None when the expression is not the tenant column.
    fn tenant_column_ref(&self, expr: &Expr) -> Option<Option<String>> {
        match unwrap_nested(expr) {
            Expr::Identifier(ident) if ident.value.to_lowercase() == self.tenant_column => {
                Some(None)
            }
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let last = parts.last()?;
                if last.value.to_lowercase() != self.tenant_column {
                    return None;
                }
                Some(Some(parts[parts.len() - 2].value.to_lowercase()))
            }
            _ => None,
        }
    }

    fn check_function(&mut self, function: &Function) {
        let name = function.name.to_string().to_lowercase();
        if !self.allowed_functions.contains(&name) {
            self.forbidden(format!("function not allowed: {}", function.name));
        }
        for arg in &function.args {
            let arg_expr = match arg {
                FunctionArg::Named { arg, .. } => arg,
                FunctionArg::Unnamed(arg) => arg,
            };
            if let FunctionArgExpr::Expr(expr) = arg_expr {
                self.walk_expr(expr);
            }
        }
        if let Some(filter) = &function.filter {
            self.walk_expr(filter);
        }
        if let Some(WindowType::WindowSpec(spec)) = &function.over {
            for expr in &spec.partition_by {
                self.walk_expr(expr);
            }
            for order in &spec.order_by {
                self.walk_expr(&order.expr);
            }
        }
        for order in &function.order_by {
            self.walk_expr(&order.expr);
        }
    }

    /// Expression walk with a closed world: forms not on this list are
    /// rejected rather than silently skipped, so a construct the guard
    /// does not understand can never smuggle anything past it.
    fn walk_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Value(_) => {}
            Expr::TypedString { .. } => {}
            Expr::BinaryOp { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::UnaryOp { expr, .. } => self.walk_expr(expr),
            Expr::Nested(inner) => self.walk_expr(inner),
            Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner)
            | Expr::IsUnknown(inner)
            | Expr::IsNotUnknown(inner) => self.walk_expr(inner),
            Expr::IsDistinctFrom(a, b) | Expr::IsNotDistinctFrom(a, b) => {
                self.walk_expr(a);
                self.walk_expr(b);
            }
            Expr::InList { expr, list, .. } => {
                self.walk_expr(expr);
                for item in list {
                    self.walk_expr(item);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.complexity += 1;
                self.walk_expr(expr);
                self.walk_query(subquery);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.walk_expr(expr);
                self.walk_expr(low);
                self.walk_expr(high);
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.walk_expr(expr);
                self.walk_expr(pattern);
            }
            Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } => self.walk_expr(expr),
            Expr::Extract { expr, .. } => self.walk_expr(expr),
            Expr::Ceil { expr, .. } | Expr::Floor { expr, .. } => self.walk_expr(expr),
            Expr::Position { expr, r#in } => {
                self.walk_expr(expr);
                self.walk_expr(r#in);
            }
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                self.walk_expr(expr);
                if let Some(from) = substring_from {
                    self.walk_expr(from);
                }
                if let Some(length) = substring_for {
                    self.walk_expr(length);
                }
            }
            Expr::Trim {
                expr, trim_what, ..
            } => {
                self.walk_expr(expr);
                if let Some(what) = trim_what {
                    self.walk_expr(what);
                }
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.walk_expr(operand);
                }
                for condition in conditions {
                    self.walk_expr(condition);
                }
                for result in results {
                    self.walk_expr(result);
                }
                if let Some(else_result) = else_result {
                    self.walk_expr(else_result);
                }
            }
            Expr::Function(function) => self.check_function(function),
            Expr::Exists { subquery, .. } => {
                self.complexity += 1;
                self.walk_query(subquery);
            }
            Expr::Subquery(subquery) => {
                self.complexity += 1;
                self.walk_query(subquery);
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.walk_expr(item);
                }
            }
            Expr::Interval(interval) => self.walk_expr(&interval.value),
            other => self.forbidden(format!("expression form not allowed: {}", other)),
        }
    }
}

fn is_system_object(name: &ObjectName) -> bool {
    let parts: Vec<String> = name.0.iter().map(|i| i.value.to_lowercase()).collect();
    if parts.len() > 1 && SYSTEM_SCHEMAS.iter().any(|s| parts[0] == *s) {
        return true;
    }
    match parts.last() {
        Some(last) => {
            last.as_str() == "sqlite_master"
                || SYSTEM_PREFIXES.iter().any(|p| last.starts_with(p))
        }
        None => true,
    }
}

/// Splits an expression on top-level AND, unwrapping parentheses. Anything
/// under an OR stays a single opaque conjunct.
fn collect_conjuncts<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        Expr::Nested(inner) => collect_conjuncts(inner, out),
        other => out.push(other),
    }
}

fn unwrap_nested(expr: &Expr) -> &Expr {
    let mut current = expr;
    while let Expr::Nested(inner) = current {
        current = inner;
    }
    current
}

/// The only shape accepted as a tenant binding value: a bare integer
/// literal. Parameters, arithmetic and casts all fail closed.
fn literal_i64(expr: &Expr) -> Option<i64> {
    match unwrap_nested(expr) {
        Expr::Value(Value::Number(text, _)) => text.parse::<i64>().ok(),
        _ => None,
    }
}
