//! Prompt context assembly under a character budget.
//!
//! Layout is fixed: schema description, then sample rows (tables in name
//! order), then retrieved documents in rank order. When the rendered text
//! exceeds `max_chars`, the lowest-ranked documents go first, then sample
//! rows from the last table backwards. The schema is never cut.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ContextConfig;
use crate::lexical::tokenize;
use crate::models::{RankedResult, Row};

/// Rendered context plus what had to be left out.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    /// Section tags of the documents that made it into `text`, in rank order.
    pub sections_used: Vec<String>,
    pub dropped_documents: usize,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_chars: usize,
    sample_rows_per_table: usize,
}

impl ContextAssembler {
    pub fn new(max_chars: usize, sample_rows_per_table: usize) -> Self {
        Self {
            max_chars,
            sample_rows_per_table,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.max_chars, config.sample_rows_per_table)
    }

    pub fn sample_rows_per_table(&self) -> usize {
        self.sample_rows_per_table
    }

    pub fn assemble(
        &self,
        retrieved: &[RankedResult],
        schema_description: &str,
        sample_rows: &BTreeMap<String, Vec<Row>>,
    ) -> AssembledContext {
        let mut docs: Vec<&RankedResult> = retrieved.iter().collect();
        let mut samples: Vec<(&str, Vec<&Row>)> = sample_rows
            .iter()
            .map(|(table, rows)| {
                (
                    table.as_str(),
                    rows.iter().take(self.sample_rows_per_table).collect::<Vec<_>>(),
                )
            })
            .filter(|(_, rows)| !rows.is_empty())
            .collect();

        let mut dropped_documents = 0;
        let mut dropped_rows = 0;
        let mut text = render(schema_description, &samples, &docs);

        while text.len() > self.max_chars {
            if docs.pop().is_some() {
                dropped_documents += 1;
            } else if let Some((_, rows)) = samples.last_mut() {
                rows.pop();
                dropped_rows += 1;
                if rows.is_empty() {
                    samples.pop();
                }
            } else {
                break;
            }
            text = render(schema_description, &samples, &docs);
        }

        if dropped_documents > 0 || dropped_rows > 0 {
            tracing::debug!(
                dropped_documents,
                dropped_rows,
                chars = text.len(),
                max_chars = self.max_chars,
                "context trimmed to budget"
            );
        }

        AssembledContext {
            text,
            sections_used: docs.iter().map(|r| r.document.section.clone()).collect(),
            dropped_documents,
            dropped_rows,
        }
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

fn render(schema: &str, samples: &[(&str, Vec<&Row>)], docs: &[&RankedResult]) -> String {
    let mut out = String::from("Database Schema:\n");
    out.push_str(schema);

    for (table, rows) in samples {
        out.push_str(&format!("\n\nSample data from {}:", table));
        for (i, row) in rows.iter().enumerate() {
            let json = serde_json::Value::Object((*row).clone());
            out.push_str(&format!("\nRow {}: {}", i + 1, json));
        }
    }

    if !docs.is_empty() {
        out.push_str("\n\nBusiness Context:");
        for r in docs {
            out.push_str(&format!(
                "\n\nContext from {} - {}:\n{}",
                r.document.table, r.document.section, r.document.content
            ));
        }
    }
    out
}

/// Keyword → table rules used to pick which tables to sample.
const TABLE_RULES: &[(&[&str], &str)] = &[
    (
        &["plant", "plants", "reactor", "reactors", "capacity", "operational"],
        "nuclear_power_plants",
    ),
    (&["country", "countries", "nation", "nations"], "countries"),
    (
        &["status", "operational", "shutdown", "construction"],
        "nuclear_power_plant_status_types",
    ),
    (
        &["reactor", "reactors", "technology", "pwr", "bwr", "type", "types"],
        "nuclear_reactor_types",
    ),
];

/// Tables relevant to `query`: keyword rule hits plus the tables owning the
/// retrieved documents. Sorted, de-duplicated.
pub fn identify_relevant_tables(query: &str, documents: &[RankedResult]) -> Vec<String> {
    let tokens: BTreeSet<String> = tokenize(query).into_iter().collect();
    let mut tables: BTreeSet<String> = BTreeSet::new();

    for (keywords, table) in TABLE_RULES {
        if keywords.iter().any(|k| tokens.contains(*k)) {
            tables.insert(table.to_string());
        }
    }
    for r in documents {
        tables.insert(r.document.table.clone());
    }
    tables.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use serde_json::json;
    use std::sync::Arc;

    fn result(table: &str, section: &str, content: &str, score: f64) -> RankedResult {
        RankedResult::lexical(Arc::new(Document::new(table, section, content)), score)
    }

    fn row(id: i64) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), json!(id));
        r
    }

    fn samples() -> BTreeMap<String, Vec<Row>> {
        let mut m = BTreeMap::new();
        m.insert("b_table".to_string(), vec![row(1), row(2), row(3), row(4)]);
        m.insert("a_table".to_string(), vec![row(10)]);
        m
    }

    #[test]
    fn test_layout_order() {
        let docs = vec![result("a_table", "rules", "StatusId = 3", 2.0)];
        let ctx = ContextAssembler::new(10_000, 3).assemble(&docs, "SCHEMA", &samples());
        let schema = ctx.text.find("SCHEMA").unwrap();
        let a = ctx.text.find("Sample data from a_table").unwrap();
        let b = ctx.text.find("Sample data from b_table").unwrap();
        let rules = ctx.text.find("Context from a_table - rules:").unwrap();
        assert!(schema < a && a < b && b < rules);
        // capped at 3 rows per table
        assert!(!ctx.text.contains("\"id\":4"));
        assert_eq!(ctx.sections_used, vec!["rules"]);
    }

    #[test]
    fn test_empty_retrieval_gives_schema_context() {
        let ctx = ContextAssembler::default().assemble(&[], "SCHEMA", &BTreeMap::new());
        assert_eq!(ctx.text, "Database Schema:\nSCHEMA");
        assert!(ctx.sections_used.is_empty());
    }

    #[test]
    fn test_budget_drops_lowest_ranked_documents_first() {
        let docs = vec![
            result("t", "first", &"x".repeat(40), 3.0),
            result("t", "second", &"y".repeat(40), 2.0),
            result("t", "third", &"z".repeat(40), 1.0),
        ];
        let full = ContextAssembler::new(10_000, 3).assemble(&docs, "S", &BTreeMap::new());
        let budget = full.text.len() - 30;
        let ctx = ContextAssembler::new(budget, 3).assemble(&docs, "S", &BTreeMap::new());
        assert_eq!(ctx.sections_used, vec!["first", "second"]);
        assert_eq!(ctx.dropped_documents, 1);
        assert!(ctx.text.len() <= budget);
    }

    #[test]
    fn test_budget_then_drops_rows_from_last_table() {
        let docs = vec![result("t", "only", "rule text", 1.0)];
        let ctx = ContextAssembler::new(110, 3).assemble(&docs, "SCHEMA", &samples());
        assert_eq!(ctx.dropped_documents, 1);
        assert!(ctx.dropped_rows > 0);
        assert!(ctx.text.contains("Sample data from a_table"));
        assert!(ctx.text.len() <= 110);
    }

    #[test]
    fn test_schema_never_truncated() {
        let schema = "S".repeat(500);
        let docs = vec![result("t", "only", "rule", 1.0)];
        let ctx = ContextAssembler::new(10, 3).assemble(&docs, &schema, &samples());
        assert!(ctx.text.contains(&schema));
        assert_eq!(ctx.dropped_documents, 1);
        assert_eq!(ctx.dropped_rows, 4);
    }

    #[test]
    fn test_relevant_tables_from_keywords_and_documents() {
        let docs = vec![result("countries", "overview", "codes", 1.0)];
        let tables = identify_relevant_tables("How many PWR reactors are operational?", &docs);
        assert_eq!(
            tables,
            vec![
                "countries",
                "nuclear_power_plant_status_types",
                "nuclear_power_plants",
                "nuclear_reactor_types",
            ]
        );
        assert!(identify_relevant_tables("hello", &[]).is_empty());
    }
}
