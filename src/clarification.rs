//! Ambiguity detection before an agent run.
//!
//! The check is deliberately conservative. A query is only sent to the model
//! for a verdict when it names nothing concrete (no entity, metric, filter,
//! number or quoted value) and the conversation cannot fill the gap.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::conversation::followup_rule;
use crate::error::with_timeout;
use crate::llm::LanguageModel;
use crate::models::{Clarification, ConversationTurn};

/// Words that pin a query to something answerable in this schema.
const ANCHOR_VOCABULARY: &[&str] = &[
    "plant", "plants", "reactor", "reactors", "capacity", "mw", "megawatt", "megawatts",
    "country", "countries", "nation", "nations", "status", "operational", "operating",
    "shutdown", "closed", "retired", "construction", "planned", "pwr", "bwr", "vver", "epr",
    "apwr", "abwr", "count", "number", "total", "sum", "average", "avg", "largest",
    "smallest", "biggest", "oldest", "newest", "top", "most", "latitude", "longitude",
    "model", "type", "types", "year", "years", "built", "since", "before", "after",
    "between",
];

const DEFAULT_QUESTIONS: &[&str] = &[
    "Which measure are you interested in: number of plants, total capacity, or status?",
    "Should the results be limited to a country, a reactor type, or an operational status?",
];

const CLARIFY_SYSTEM: &str = "You decide whether a question about a nuclear power plant database is too ambiguous to turn into SQL. Only flag questions that cannot be answered without more information.

Respond with JSON only:
{\"needs_clarification\": true|false, \"questions\": [\"...\"]}";

/// Whether `query` names an entity, metric or filter.
pub fn has_anchor(query: &str) -> bool {
    if query.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    if query.matches('"').count() >= 2 || query.matches('\'').count() >= 2 {
        return true;
    }
    let words: Vec<&str> = query.split_whitespace().collect();
    // Capitalized words after the first are taken as proper nouns.
    if words
        .iter()
        .skip(1)
        .any(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
    {
        return true;
    }
    let lower = query.to_lowercase();
    crate::lexical::tokenize(&lower)
        .iter()
        .any(|t| ANCHOR_VOCABULARY.contains(&t.as_str()))
}

/// Whether prior turns can supply what `query` leaves out.
pub fn resolvable_from_history(query: &str, history: &[ConversationTurn]) -> bool {
    !history.is_empty() && followup_rule(query).is_some()
}

#[derive(Deserialize)]
struct ClarifyVerdict {
    needs_clarification: bool,
    #[serde(default)]
    questions: Vec<String>,
}

#[derive(Clone)]
pub struct ClarificationDetector {
    model: Arc<dyn LanguageModel>,
    call_timeout: Duration,
}

impl ClarificationDetector {
    pub fn new(model: Arc<dyn LanguageModel>, call_timeout: Duration) -> Self {
        Self {
            model,
            call_timeout,
        }
    }

    pub async fn detect(&self, query: &str, history: &[ConversationTurn]) -> Clarification {
        if has_anchor(query) || resolvable_from_history(query, history) {
            return Clarification::clear();
        }

        let prompt = format!("Question: {}", query);
        let answer = match with_timeout(
            "clarification",
            self.call_timeout,
            self.model.complete(CLARIFY_SYSTEM, &prompt),
        )
        .await
        {
            Ok(c) => c.text,
            Err(e) => {
                tracing::warn!(error = %e, "clarification check unavailable, proceeding");
                return Clarification::clear();
            }
        };

        let verdict = answer
            .find('{')
            .zip(answer.rfind('}'))
            .filter(|(start, end)| start < end)
            .and_then(|(start, end)| serde_json::from_str::<ClarifyVerdict>(&answer[start..=end]).ok());

        match verdict {
            Some(v) if v.needs_clarification => {
                let questions: Vec<String> = v
                    .questions
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect();
                let questions = if questions.is_empty() {
                    DEFAULT_QUESTIONS.iter().map(|q| q.to_string()).collect()
                } else {
                    questions
                };
                tracing::info!(query, questions = questions.len(), "clarification requested");
                Clarification {
                    needs_clarification: true,
                    questions,
                }
            }
            _ => Clarification::clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Text2SqlError;
    use crate::llm::testing::FnModel;
    use chrono::Utc;

    fn history() -> Vec<ConversationTurn> {
        vec![ConversationTurn {
            session_id: "s".into(),
            user_query: "List nuclear power plants in Germany".into(),
            resolved_query: "List nuclear power plants in Germany".into(),
            generated_sql: "SELECT 1;".into(),
            timestamp: Utc::now(),
        }]
    }

    #[test]
    fn test_anchor_detection() {
        assert!(has_anchor("How many operational nuclear power plants are there?"));
        assert!(has_anchor("What about France?"));
        assert!(has_anchor("show rows for 2015"));
        assert!(has_anchor("find 'Flamanville'"));
        assert!(!has_anchor("Show me the data"));
        assert!(!has_anchor("what is going on"));
    }

    #[tokio::test]
    async fn test_anchored_query_never_asks_model() {
        let model = Arc::new(FnModel::new(|_, _| {
            Ok("{\"needs_clarification\": true}".to_string())
        }));
        let d = ClarificationDetector::new(model.clone(), Duration::from_secs(1));
        let out = d.detect("Total capacity by country", &[]).await;
        assert!(!out.needs_clarification);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_history_resolves_vague_followup() {
        let model = Arc::new(FnModel::new(|_, _| {
            Ok("{\"needs_clarification\": true}".to_string())
        }));
        let d = ClarificationDetector::new(model.clone(), Duration::from_secs(1));
        let out = d.detect("show me those again", &history()).await;
        assert!(!out.needs_clarification);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_vague_query_gets_default_questions() {
        let model = Arc::new(FnModel::new(|_, _| {
            Ok("{\"needs_clarification\": true, \"questions\": []}".to_string())
        }));
        let d = ClarificationDetector::new(model, Duration::from_secs(1));
        let out = d.detect("Show me the data", &[]).await;
        assert!(out.needs_clarification);
        assert_eq!(out.questions.len(), DEFAULT_QUESTIONS.len());
    }

    #[tokio::test]
    async fn test_model_failure_does_not_block() {
        let model = Arc::new(FnModel::new(|_, _| Err(Text2SqlError::Model("down".into()))));
        let d = ClarificationDetector::new(model, Duration::from_secs(1));
        assert_eq!(d.detect("Show me the data", &[]).await, Clarification::clear());
    }
}
