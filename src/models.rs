//! Core data models shared by retrieval, generation and orchestration.
//!
//! These types flow from the corpus through the indices and the agent loop
//! into the response objects serialized by the HTTP server.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of retrievable metadata (business rule, query pattern, overview).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable within one corpus build, unique.
    pub id: String,
    /// Owning table name.
    pub table: String,
    /// Topic tag, e.g. `operational_definition`.
    pub section: String,
    pub content: String,
}

impl Document {
    /// Builds a document whose id is `"{table}/{section}"`.
    pub fn new(table: &str, section: &str, content: &str) -> Self {
        Self {
            id: format!("{}/{}", table, section),
            table: table.to_string(),
            section: section.to_string(),
            content: content.to_string(),
        }
    }
}

/// Which index produced a [`RankedResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Lexical,
    Semantic,
    Both,
}

/// A scored reference to a [`Document`].
///
/// Within one ranked list, scores are non-increasing in list order.
#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub document: Arc<Document>,
    pub score: f64,
    pub source: RetrievalSource,
    /// Raw BM25 score, when the lexical index saw this document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    /// Raw cosine similarity, when the semantic index saw this document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
}

impl RankedResult {
    pub fn lexical(document: Arc<Document>, score: f64) -> Self {
        Self {
            document,
            score,
            source: RetrievalSource::Lexical,
            lexical_score: Some(score),
            semantic_score: None,
        }
    }

    pub fn semantic(document: Arc<Document>, score: f64) -> Self {
        Self {
            document,
            score,
            source: RetrievalSource::Semantic,
            lexical_score: None,
            semantic_score: Some(score),
        }
    }

    pub fn id(&self) -> &str {
        &self.document.id
    }
}

/// Summary of one hybrid retrieval call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalStats {
    pub lexical_count: usize,
    pub semantic_count: usize,
    pub merged_count: usize,
}

/// One exchange within a conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub user_query: String,
    pub resolved_query: String,
    pub generated_sql: String,
    pub timestamp: DateTime<Utc>,
}

/// A result row: column name → JSON value, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Outcome reported by the SQL execution collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    /// Rows the query produced, even when `data` was cut short.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    /// `data` holds fewer rows than `row_count`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn rows(data: Vec<Row>) -> Self {
        Self {
            success: true,
            row_count: Some(data.len()),
            data: Some(data),
            truncated: false,
            error: None,
        }
    }

    /// The first rows of a larger result of `total` rows.
    pub fn truncated(data: Vec<Row>, total: usize) -> Self {
        Self {
            success: true,
            truncated: total > data.len(),
            row_count: Some(total.max(data.len())),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            row_count: None,
            truncated: false,
            error: Some(error.into()),
        }
    }
}

/// Mechanical check of an execution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub query_executed: bool,
    pub has_results: bool,
    pub error_present: bool,
    pub overall_valid: bool,
}

/// Semantic quality assessment of generated SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionResult {
    pub is_acceptable: bool,
    /// In `[0.0, 1.0]`.
    pub confidence: f64,
    pub issues: Vec<String>,
    pub should_refine: bool,
    /// Set when refinement was wanted but the iteration budget ran out.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refinement_exhausted: bool,
}

/// Verdict of the clarification detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub needs_clarification: bool,
    pub questions: Vec<String>,
}

impl Clarification {
    pub fn clear() -> Self {
        Self::default()
    }
}

/// Which generation strategy produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Simple,
    Advanced,
    Chat,
    Agentic,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Simple => "simple",
            Method::Advanced => "advanced",
            Method::Chat => "chat",
            Method::Agentic => "agentic",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(Method::Simple),
            "advanced" => Ok(Method::Advanced),
            "chat" => Ok(Method::Chat),
            "agentic" => Ok(Method::Agentic),
            other => Err(format!(
                "unknown method '{}': expected simple, advanced, chat or agentic",
                other
            )),
        }
    }
}
