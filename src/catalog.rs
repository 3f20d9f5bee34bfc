use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Immutable, versioned description of the analytics schema: tables,
/// columns, tenant scoping, business vocabulary and worked examples.
///
/// Supplied whole by the catalog provider and loaded once at startup.
/// Nothing in the pipeline mutates it; it travels by reference so prompt
/// composition and validation stay reproducible for a pinned version.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaSnapshot {
    pub version: String,
    /// Free-text introduction shown to the model ahead of the table list.
    pub description: String,
    /// Column every tenant-scoped table carries, e.g. "bar_id".
    pub tenant_column: String,
    pub tables: Vec<TableMeta>,
    #[serde(default)]
    pub glossary: Vec<GlossaryEntry>,
    #[serde(default)]
    pub examples: Vec<WorkedExample>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableMeta {
    pub name: String,
    /// Whether this table carries the tenant-scoping column and therefore
    /// must be filtered to a single tenant in every query.
    pub tenant_scoped: bool,
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlossaryEntry {
    pub term: String,
    pub definition: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkedExample {
    pub question: String,
    pub sql: String,
}

impl SchemaSnapshot {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Lowercased names of every table that must carry a tenant predicate.
    pub fn tenant_scoped_tables(&self) -> HashSet<String> {
        self.tables
            .iter()
            .filter(|t| t.tenant_scoped)
            .map(|t| t.name.to_lowercase())
            .collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}
