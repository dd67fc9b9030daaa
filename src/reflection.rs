//! Result validation and model-backed self-review of generated SQL.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::with_timeout;
use crate::llm::LanguageModel;
use crate::models::{ExecutionResult, ReflectionResult, ValidationResult};

const REVIEW_SYSTEM: &str = "You review SQL written for a nuclear power plant database. Decide whether the SQL correctly answers the user's question.

Respond with JSON only, no prose:
{\"is_acceptable\": true|false, \"confidence\": 0.0-1.0, \"issues\": [\"...\"]}";

/// Mechanical check of an execution outcome.
pub fn validate(result: &ExecutionResult) -> ValidationResult {
    let query_executed = result.success;
    let error_present = result.error.is_some();
    ValidationResult {
        query_executed,
        has_results: result.row_count.unwrap_or(0) > 0,
        error_present,
        overall_valid: query_executed && !error_present,
    }
}

#[derive(Deserialize)]
struct ReviewVerdict {
    is_acceptable: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    issues: Vec<String>,
}

#[derive(Clone)]
pub struct Reflector {
    model: Arc<dyn LanguageModel>,
    call_timeout: Duration,
}

impl Reflector {
    pub fn new(model: Arc<dyn LanguageModel>, call_timeout: Duration) -> Self {
        Self {
            model,
            call_timeout,
        }
    }

    /// Judge whether `sql` answers `query`.
    ///
    /// A failed execution is unacceptable without asking the model. A model
    /// that fails or answers off-format is treated as accepting with zero
    /// confidence.
    pub async fn reflect(
        &self,
        query: &str,
        sql: &str,
        execution: Option<&ExecutionResult>,
        iterations_remaining: u32,
    ) -> ReflectionResult {
        if let Some(result) = execution.filter(|r| !r.success) {
            let issue = result
                .error
                .clone()
                .unwrap_or_else(|| "query execution failed".to_string());
            return verdict(false, 1.0, vec![issue], iterations_remaining);
        }

        let mut prompt = format!("User Question: {}\n\nSQL:\n{}\n", query, sql);
        match execution {
            Some(result) => {
                let rows = result.row_count.unwrap_or(0);
                prompt.push_str(&format!("\nThe query executed and returned {} rows.", rows));
                if let Some(first) = result.data.as_ref().and_then(|d| d.first()) {
                    prompt.push_str(&format!(
                        "\nFirst row: {}",
                        serde_json::Value::Object(first.clone())
                    ));
                }
            }
            None => prompt.push_str("\nThe query was not executed."),
        }

        let answer = match with_timeout(
            "reflection",
            self.call_timeout,
            self.model.complete(REVIEW_SYSTEM, &prompt),
        )
        .await
        {
            Ok(c) => c.text,
            Err(e) => {
                tracing::warn!(error = %e, "reflection model unavailable, accepting SQL");
                return verdict(
                    true,
                    0.0,
                    vec![format!("reflection unavailable: {}", e)],
                    iterations_remaining,
                );
            }
        };

        match parse_verdict(&answer) {
            Some(v) => verdict(
                v.is_acceptable,
                v.confidence.clamp(0.0, 1.0),
                v.issues,
                iterations_remaining,
            ),
            None => {
                tracing::warn!("reflection answer was not valid JSON, accepting SQL");
                verdict(
                    true,
                    0.0,
                    vec!["reflection answer could not be parsed".to_string()],
                    iterations_remaining,
                )
            }
        }
    }
}

fn verdict(
    is_acceptable: bool,
    confidence: f64,
    issues: Vec<String>,
    iterations_remaining: u32,
) -> ReflectionResult {
    ReflectionResult {
        is_acceptable,
        confidence,
        issues,
        should_refine: !is_acceptable && iterations_remaining > 0,
        refinement_exhausted: false,
    }
}

/// The outermost `{...}` span of `text`, parsed as a verdict.
fn parse_verdict(text: &str) -> Option<ReviewVerdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Text2SqlError;
    use crate::llm::testing::FnModel;
    use crate::models::Row;

    fn reflector(answer: &'static str) -> (Reflector, Arc<FnModel<impl Fn(&str, &str) -> crate::error::Result<String> + Send + Sync>>) {
        let model = Arc::new(FnModel::new(move |_, _| Ok(answer.to_string())));
        (Reflector::new(model.clone(), Duration::from_secs(1)), model)
    }

    #[test]
    fn test_validate_failed_execution() {
        let v = validate(&ExecutionResult::failure("table not found"));
        assert!(!v.query_executed);
        assert!(v.error_present);
        assert!(!v.overall_valid);
        assert!(!v.has_results);
    }

    #[test]
    fn test_validate_empty_success_is_valid() {
        let v = validate(&ExecutionResult::rows(Vec::new()));
        assert!(v.overall_valid);
        assert!(!v.has_results);

        let mut row = Row::new();
        row.insert("n".into(), serde_json::json!(1));
        assert!(validate(&ExecutionResult::rows(vec![row])).has_results);
    }

    #[tokio::test]
    async fn test_execution_failure_skips_model() {
        let (r, model) = reflector("{\"is_acceptable\": true}");
        let result = ExecutionResult::failure("table not found");
        let out = r.reflect("q", "SELECT 1", Some(&result), 2).await;
        assert!(!out.is_acceptable);
        assert!(out.should_refine);
        assert_eq!(out.issues, vec!["table not found"]);
        assert_eq!(model.calls(), 0);

        let out = r.reflect("q", "SELECT 1", Some(&result), 0).await;
        assert!(!out.should_refine);
    }

    #[tokio::test]
    async fn test_parses_fenced_json_verdict() {
        let (r, _) = reflector(
            "```json\n{\"is_acceptable\": false, \"confidence\": 1.7, \"issues\": [\"missing StatusId filter\"]}\n```",
        );
        let out = r.reflect("q", "SELECT 1", None, 1).await;
        assert!(!out.is_acceptable);
        assert_eq!(out.confidence, 1.0);
        assert!(out.should_refine);
        assert_eq!(out.issues, vec!["missing StatusId filter"]);
    }

    #[tokio::test]
    async fn test_unparsable_or_failed_model_accepts() {
        let (r, _) = reflector("looks fine to me");
        let out = r.reflect("q", "SELECT 1", None, 2).await;
        assert!(out.is_acceptable);
        assert_eq!(out.confidence, 0.0);
        assert!(!out.should_refine);

        let failing = Arc::new(FnModel::new(|_, _| Err(Text2SqlError::Model("down".into()))));
        let out = Reflector::new(failing, Duration::from_secs(1))
            .reflect("q", "SELECT 1", None, 2)
            .await;
        assert!(out.is_acceptable);
        assert_eq!(out.issues.len(), 1);
    }
}
