use serde::{Deserialize, Serialize};

/// What the caller wants back besides the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    #[default]
    Query,
    Analysis,
    Optimization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// The structured candidate decoded from the model reply.
///
/// Either every field is present and well-typed or the object does not
/// exist at all; the pipeline never works with a partially-filled one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub sql: String,
    pub explanation: String,
    pub columns: Vec<String>,
    pub metrics: Vec<String>,
    pub complexity: Complexity,
    pub estimated_time: String,
}

/// Why a raw model reply failed to become a `GeneratedQuery`.
#[derive(Debug)]
pub enum ContractFailure {
    /// No balanced `{...}` block in the reply parsed as a JSON object.
    NoJsonObject,
    /// A JSON object was found but a required field was absent or mistyped.
    FieldMismatch(String),
}

/// Locates the first well-formed JSON object in `raw` and decodes it
/// against the output contract.
///
/// Models wrap their answer in prose or code fences often enough that we
/// scan for balanced braces instead of parsing the whole reply.
pub fn parse_generated(raw: &str) -> Result<GeneratedQuery, ContractFailure> {
    let mut search_from = 0;
    while let Some(candidate) = next_json_object(raw, &mut search_from) {
        let value: serde_json::Value = match serde_json::from_str(candidate) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !value.is_object() {
            continue;
        }
        return serde_json::from_value(value)
            .map_err(|e| ContractFailure::FieldMismatch(e.to_string()));
    }
    Err(ContractFailure::NoJsonObject)
}

/// Returns the next balanced `{...}` slice starting at or after
/// `*search_from`, advancing the cursor past its opening brace.
/// String literals and escapes are honoured so braces inside SQL text
/// don't derail the scan.
fn next_json_object<'a>(raw: &'a str, search_from: &mut usize) -> Option<&'a str> {
    let bytes = raw.as_bytes();
    let start = raw[*search_from..].find('{')? + *search_from;
    *search_from = start + 1;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT_REPLY: &str = r#"Here is the query you asked for:
```json
{
  "sql": "SELECT real_r FROM eventos_base WHERE bar_id = 3 LIMIT 10",
  "explanation": "Yesterday's revenue for the venue.",
  "columns": ["real_r"],
  "metrics": ["faturamento"],
  "complexity": "low",
  "estimated_time": "fast"
}
```
Let me know if you need anything else."#;

    #[test]
    fn decodes_contract_object_out_of_prose() {
        let generated = parse_generated(CONTRACT_REPLY).unwrap();
        assert!(generated.sql.starts_with("SELECT real_r"));
        assert_eq!(generated.complexity, Complexity::Low);
        assert_eq!(generated.columns, vec!["real_r"]);
    }

    #[test]
    fn plain_text_reply_is_no_json() {
        let err = parse_generated("I cannot answer that question.").unwrap_err();
        assert!(matches!(err, ContractFailure::NoJsonObject));
    }

    #[test]
    fn missing_field_is_contract_failure() {
        let err = parse_generated(r#"{"sql": "SELECT 1", "explanation": "x"}"#).unwrap_err();
        assert!(matches!(err, ContractFailure::FieldMismatch(_)));
    }

    #[test]
    fn wrong_field_type_is_contract_failure() {
        let reply = r#"{
            "sql": "SELECT 1", "explanation": "x", "columns": "not-a-list",
            "metrics": [], "complexity": "low", "estimated_time": "fast"
        }"#;
        let err = parse_generated(reply).unwrap_err();
        assert!(matches!(err, ContractFailure::FieldMismatch(_)));
    }

    #[test]
    fn braces_inside_sql_strings_do_not_break_the_scan() {
        let reply = r#"{
            "sql": "SELECT '{weird}' FROM eventos_base WHERE bar_id = 3",
            "explanation": "literal braces",
            "columns": ["c"], "metrics": [], "complexity": "low",
            "estimated_time": "fast"
        }"#;
        let generated = parse_generated(reply).unwrap();
        assert!(generated.sql.contains("{weird}"));
    }

    #[test]
    fn skips_unparseable_brace_blocks() {
        let reply = r#"think {not json} then {"sql": "SELECT 1", "explanation": "e",
            "columns": [], "metrics": [], "complexity": "medium", "estimated_time": "fast"}"#;
        let generated = parse_generated(reply).unwrap();
        assert_eq!(generated.complexity, Complexity::Medium);
    }
}
