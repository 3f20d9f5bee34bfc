use crate::catalog::SchemaSnapshot;
use crate::llm::models::AnalysisType;
use std::fmt::Write;

/// Composes the full prompt for one request.
///
/// Pure: the same (tenant, question, analysis type, catalog version) always
/// yields byte-identical text, so everything upstream of the model call can
/// be tested without a network.
pub fn compose(
    tenant_id: i64,
    question: &str,
    analysis_type: AnalysisType,
    snapshot: &SchemaSnapshot,
) -> String {
    let mut prompt = String::new();

    let _ = write!(
        prompt,
        r#"### Instructions:
You are a SQL analyst for a bar and venue management platform. Convert the
business question below into a single read-only SQL query for DuckDB.
Adhere to these rules:
- Generate exactly ONE SELECT statement. Never write, alter or drop anything.
- Every table that carries the `{tenant}` column MUST be filtered with
  `{tenant} = {id}`. Queries for any other venue are forbidden.
- Use the exact table and column spellings from the schema below.
- Use table aliases to prevent ambiguity in joins.
- When creating a ratio, always cast the numerator as float.
{analysis_rule}
### Schema (catalog version {version}):
{description}
"#,
        tenant = snapshot.tenant_column,
        id = tenant_id,
        analysis_rule = analysis_rule(analysis_type),
        version = snapshot.version,
        description = snapshot.description.trim(),
    );

    for table in &snapshot.tables {
        let _ = write!(prompt, "\nTable `{}`", table.name);
        if table.tenant_scoped {
            let _ = write!(prompt, " (per-venue, filter on `{}`)", snapshot.tenant_column);
        }
        let _ = writeln!(prompt, ":");
        for column in &table.columns {
            match &column.description {
                Some(desc) => {
                    let _ = writeln!(prompt, "- {} {} -- {}", column.name, column.data_type, desc);
                }
                None => {
                    let _ = writeln!(prompt, "- {} {}", column.name, column.data_type);
                }
            }
        }
    }

    if !snapshot.glossary.is_empty() {
        let _ = write!(prompt, "\n### Business vocabulary:\n");
        for entry in &snapshot.glossary {
            let _ = writeln!(prompt, "- {}: {}", entry.term, entry.definition);
        }
    }

    if !snapshot.examples.is_empty() {
        let _ = write!(prompt, "\n### Worked examples:\n");
        for example in &snapshot.examples {
            let _ = writeln!(prompt, "Q: {}\nSQL: {}", example.question, example.sql);
        }
    }

    let _ = write!(
        prompt,
        r#"
### Question:
{question}

### Output contract:
Answer with a single JSON object and nothing else. Required fields:
{{
  "sql": "<the query, one SELECT statement>",
  "explanation": "<one or two sentences in the caller's language>",
  "columns": ["<each column the query returns>"],
  "metrics": ["<business metrics the query relates to>"],
  "complexity": "low" | "medium" | "high",
  "estimated_time": "<rough human estimate, e.g. 'under a second'>"
}}
"#,
    );

    prompt
}

fn analysis_rule(analysis_type: AnalysisType) -> &'static str {
    match analysis_type {
        AnalysisType::Query => "- Answer the question directly with the smallest correct query.\n",
        AnalysisType::Analysis => {
            "- The caller wants an analysis: prefer aggregates, groupings and period comparisons over raw rows.\n"
        }
        AnalysisType::Optimization => {
            "- The caller is investigating performance: surface totals, rankings and outliers that point at waste.\n"
        }
    }
}
