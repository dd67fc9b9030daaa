//! SQL generation: prompt templates, the model call, and SQL extraction.
//!
//! Generation never retries; a failed or unparsable answer is reported to
//! the caller, which decides whether another attempt is worth an iteration.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::error::{with_timeout, Result, Text2SqlError};
use crate::llm::LanguageModel;
use crate::models::{ExecutionResult, Method};

const SIMPLE_SYSTEM: &str = "You are an expert SQL query generator. Generate valid SQLite queries based on the provided schema and user question.

Rules:
1. Return ONLY the SQL query, no explanations
2. Use proper JOIN syntax when accessing related tables
3. Use appropriate WHERE clauses for filtering
4. Limit results to 100 rows by default unless specified
5. Always use table aliases for clarity";

const ADVANCED_SYSTEM: &str = "You are an expert SQL query generator specialized in nuclear power plant databases.

Generate valid SQLite queries based on the provided schema, sample data, and business context.

Rules:
1. Return ONLY the SQL query, no explanations
2. Use proper JOIN syntax when accessing related tables
3. Apply business rules from the context (e.g., StatusId = 3 for operational plants)
4. Use appropriate aggregations (SUM, COUNT, AVG) when calculating metrics
5. Always include table aliases for clarity
6. Filter NULL values when appropriate
7. Limit results unless asking for aggregates";

const CHAT_SYSTEM: &str = "You are an expert SQL query generator with conversation memory.

You can handle follow-up questions that reference previous queries. Use the conversation
history to understand context and resolve ambiguous references.

Rules:
1. Return ONLY the SQL query, no explanations
2. Consider previous queries when interpreting follow-ups
3. If user asks \"show me more details\", expand on the previous query
4. If user says \"for China\" or \"in the US\", add that filter to previous context
5. Use proper JOIN syntax and business rules from context
6. Apply StatusId = 3 filter for \"operational\" or \"current\" queries";

const AGENTIC_SYSTEM: &str = "You are an SQL agent for a nuclear power plant database. You gathered the schema, sample rows and business rules below with your tools.

Rules:
1. Return ONLY the SQL query inside a ```sql block
2. Apply business rules from the context (StatusId = 3 for operational plants)
3. Use proper JOIN syntax and table aliases
4. When a previous attempt is shown, fix every listed issue";

const SUMMARY_SYSTEM: &str = "You explain SQL query results to non-technical users. Answer the user's question in two or three plain sentences using only the rows provided. Do not mention SQL.";

/// Issues found in the previous attempt, fed back into the next prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefinementFeedback {
    pub previous_sql: String,
    pub issues: Vec<String>,
    pub execution_error: Option<String>,
}

/// Inputs for one prompt. `context` is the assembled schema/rules text.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub query: &'a str,
    pub context: &'a str,
    pub conversation: Option<&'a str>,
    pub feedback: Option<&'a RefinementFeedback>,
}

impl<'a> PromptInput<'a> {
    pub fn new(query: &'a str, context: &'a str) -> Self {
        Self {
            query,
            context,
            conversation: None,
            feedback: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: &'static str,
    pub user: String,
}

/// Render the system and user prompt for `method`.
pub fn build_prompt(method: Method, input: PromptInput<'_>) -> Prompt {
    let mut user = String::new();
    match method {
        Method::Simple => {
            user.push_str(&format!("Schema:\n{}\n\n", input.context));
            user.push_str(&format!("User Question: {}\n\n", input.query));
            user.push_str("Generate a SQL query to answer this question.");
        }
        Method::Advanced => {
            user.push_str(input.context);
            user.push_str(&format!("\n\nUser Question: {}\n\n", input.query));
            user.push_str("Generate a SQL query to answer this question accurately.");
        }
        Method::Chat => {
            user.push_str(input.context);
            if let Some(conversation) = input.conversation.filter(|c| !c.is_empty()) {
                user.push_str("\n\n");
                user.push_str(conversation);
            }
            user.push_str(&format!("\n\nCurrent User Question: {}\n\n", input.query));
            user.push_str("Generate a SQL query to answer this question.");
        }
        Method::Agentic => {
            user.push_str(input.context);
            if let Some(conversation) = input.conversation.filter(|c| !c.is_empty()) {
                user.push_str("\n\n");
                user.push_str(conversation);
            }
            if let Some(feedback) = input.feedback {
                user.push_str("\n\nPrevious attempt:\n");
                user.push_str(&feedback.previous_sql);
                if let Some(err) = &feedback.execution_error {
                    user.push_str(&format!("\nExecution error: {}", err));
                }
                if !feedback.issues.is_empty() {
                    user.push_str("\nIssues found:");
                    for issue in &feedback.issues {
                        user.push_str(&format!("\n- {}", issue));
                    }
                }
            }
            user.push_str(&format!("\n\nUser Question: {}\n\n", input.query));
            user.push_str("Generate a corrected SQL query that answers this question.");
        }
    }

    let system = match method {
        Method::Simple => SIMPLE_SYSTEM,
        Method::Advanced => ADVANCED_SYSTEM,
        Method::Chat => CHAT_SYSTEM,
        Method::Agentic => AGENTIC_SYSTEM,
    };
    Prompt { system, user }
}

/// Model-backed SQL generator with a per-call deadline.
#[derive(Clone)]
pub struct SqlGenerator {
    model: Arc<dyn LanguageModel>,
    call_timeout: Duration,
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, call_timeout: Duration) -> Self {
        Self {
            model,
            call_timeout,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Raw model answer for `prompt`.
    pub async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let completion = with_timeout(
            "SQL generation",
            self.call_timeout,
            self.model.complete(prompt.system, &prompt.user),
        )
        .await?;
        Ok(completion.text)
    }

    /// [`generate`](Self::generate) followed by [`extract_sql`].
    pub async fn generate_sql(&self, prompt: &Prompt) -> Result<String> {
        let raw = self.generate(prompt).await?;
        extract_sql(&raw)
    }

    /// Plain-language answer for a successful execution. `None` when the
    /// query failed or the model is unavailable.
    pub async fn summarize_results(
        &self,
        query: &str,
        sql: &str,
        result: &ExecutionResult,
    ) -> Option<String> {
        if !result.success {
            return None;
        }
        let rows = result.data.as_deref().unwrap_or_default();
        let shown: Vec<serde_json::Value> = rows
            .iter()
            .take(20)
            .map(|r| serde_json::Value::Object(r.clone()))
            .collect();
        let prompt = format!(
            "User Question: {}\n\nSQL Query:\n{}\n\nResults ({} rows, first {} shown):\n{}",
            query,
            sql,
            rows.len(),
            shown.len(),
            serde_json::Value::Array(shown)
        );

        match with_timeout(
            "result summary",
            self.call_timeout,
            self.model.complete(SUMMARY_SYSTEM, &prompt),
        )
        .await
        {
            Ok(c) if !c.text.trim().is_empty() => Some(c.text.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "result summary unavailable");
                None
            }
        }
    }
}

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)```").ok())
        .as_ref()
}

fn statement_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^[ \t]*(SELECT|WITH|INSERT|UPDATE|DELETE|SHOW|DESCRIBE|EXPLAIN)\b").ok()
    })
    .as_ref()
}

/// Pull one SQL statement out of a model answer.
///
/// Order of preference: a ```` ```sql ```` fence, any fence, then the first
/// line that starts with a SQL keyword through the first `;` (or the end).
pub fn extract_sql(raw: &str) -> Result<String> {
    if let Some(re) = fence_regex() {
        let fences: Vec<(String, String)> = re
            .captures_iter(raw)
            .map(|c| {
                (
                    c.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default(),
                    c.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
                )
            })
            .filter(|(_, body)| !body.is_empty())
            .collect();

        if let Some((_, body)) = fences.iter().find(|(tag, _)| tag == "sql") {
            return Ok(body.clone());
        }
        if let Some((_, body)) = fences.first() {
            return Ok(body.clone());
        }
    }

    if let Some(m) = statement_regex().and_then(|re| re.captures(raw)).and_then(|c| c.get(1)) {
        let rest = &raw[m.start()..];
        let statement = match rest.find(';') {
            Some(end) => &rest[..=end],
            None => rest,
        };
        return Ok(statement.trim().to_string());
    }

    Err(Text2SqlError::Generation {
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::FnModel;
    use crate::models::Row;

    #[test]
    fn test_extract_prefers_sql_fence() {
        let raw = "Here:\n```text\nnot this\n```\n```sql\nSELECT COUNT(*) FROM nuclear_power_plants WHERE StatusId = 3;\n```";
        assert_eq!(
            extract_sql(raw).unwrap(),
            "SELECT COUNT(*) FROM nuclear_power_plants WHERE StatusId = 3;"
        );
    }

    #[test]
    fn test_extract_any_fence() {
        let raw = "```\nSELECT 1\n```";
        assert_eq!(extract_sql(raw).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_extract_keyword_line_through_semicolon() {
        let raw = "Sure! The query is:\nselect name\nfrom countries; -- done\nHope it helps.";
        assert_eq!(extract_sql(raw).unwrap(), "select name\nfrom countries;");

        let raw = "WITH x AS (SELECT 1) SELECT * FROM x";
        assert_eq!(extract_sql(raw).unwrap(), raw);
    }

    #[test]
    fn test_extract_failure_keeps_raw() {
        let raw = "Selection of plants is not possible without more details.";
        let err = extract_sql(raw).unwrap_err();
        assert_eq!(err.raw_output(), Some(raw));
    }

    #[test]
    fn test_prompts_carry_context_and_feedback() {
        let feedback = RefinementFeedback {
            previous_sql: "SELECT * FROM plants".into(),
            issues: vec!["unknown table plants".into()],
            execution_error: Some("no such table: plants".into()),
        };
        let input = PromptInput {
            query: "How many plants?",
            context: "Database Schema:\nS",
            conversation: Some("Previous conversation:\nQ1"),
            feedback: Some(&feedback),
        };
        let p = build_prompt(Method::Agentic, input);
        assert!(p.user.contains("Previous conversation:"));
        assert!(p.user.contains("- unknown table plants"));
        assert!(p.user.contains("Execution error: no such table: plants"));
        assert!(p.user.ends_with("Generate a corrected SQL query that answers this question."));

        let simple = build_prompt(Method::Simple, PromptInput::new("q", "S"));
        assert!(simple.user.starts_with("Schema:\nS"));
        assert_eq!(simple.system, SIMPLE_SYSTEM);
    }

    #[tokio::test]
    async fn test_generate_sql_times_out() {
        struct Slow;
        #[async_trait::async_trait]
        impl LanguageModel for Slow {
            fn model_name(&self) -> &str {
                "slow"
            }
            async fn complete(&self, _s: &str, _p: &str) -> Result<crate::llm::Completion> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(crate::llm::Completion::text("SELECT 1;"))
            }
        }
        let gen = SqlGenerator::new(Arc::new(Slow), Duration::from_millis(20));
        let err = gen
            .generate_sql(&build_prompt(Method::Simple, PromptInput::new("q", "S")))
            .await
            .unwrap_err();
        assert!(matches!(err, Text2SqlError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_summary_skips_failed_execution() {
        let model = Arc::new(FnModel::new(|_, _| Ok("There are 3 plants.".to_string())));
        let gen = SqlGenerator::new(model.clone(), Duration::from_secs(1));

        let failed = ExecutionResult::failure("boom");
        assert_eq!(gen.summarize_results("q", "SELECT 1", &failed).await, None);
        assert_eq!(model.calls(), 0);

        let mut row = Row::new();
        row.insert("n".into(), serde_json::json!(3));
        let ok = ExecutionResult::rows(vec![row]);
        assert_eq!(
            gen.summarize_results("q", "SELECT 1", &ok).await.as_deref(),
            Some("There are 3 plants.")
        );
    }
}
