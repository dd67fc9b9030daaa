//! Tool-using SQL agent as an explicit state machine.
//!
//! ```text
//!  DetectClarification ──ambiguous──▶ Clarify
//!          │
//!          ▼
//!  ┌──▶  Plan ──nothing missing──┐
//!  │       │                     │
//!  │       ▼                     ▼
//!  │  ExecuteTools ──────▶  GenerateSql ──outage / no budget──▶ Failed
//!  │                        │        │
//!  │   no SQL, budget left ─┘        ▼
//!  └──────────────────────────── Reflect ──accepted / no budget──▶ Complete
//!        should_refine, budget left
//! ```
//!
//! Every edge back into `Plan` spends one unit of [`IterationBudget`]; the
//! budget cannot advance past its maximum, so the loop is bounded by
//! construction. [`Agent::transition`] is the whole policy: one step in, one
//! step out.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clarification::ClarificationDetector;
use crate::config::Config;
use crate::context::{identify_relevant_tables, ContextAssembler};
use crate::conversation::conversation_context;
use crate::corpus::SchemaCatalog;
use crate::error::{with_timeout, Text2SqlError};
use crate::executor::SqlExecutor;
use crate::generation::{build_prompt, PromptInput, RefinementFeedback, SqlGenerator};
use crate::models::{
    ConversationTurn, ExecutionResult, Method, RankedResult, ReflectionResult, RetrievalStats,
    Row, ValidationResult,
};
use crate::reflection::{validate, Reflector};
use crate::retriever::HybridRetriever;

/// Tools the agent can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    GetSchema,
    GetSampleData,
    SearchMetadata,
    ExecuteSql,
    ValidateResults,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::GetSchema,
        ToolName::GetSampleData,
        ToolName::SearchMetadata,
        ToolName::ExecuteSql,
        ToolName::ValidateResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::GetSchema => "get_schema",
            ToolName::GetSampleData => "get_sample_data",
            ToolName::SearchMetadata => "search_metadata",
            ToolName::ExecuteSql => "execute_sql",
            ToolName::ValidateResults => "validate_results",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::GetSchema => "Retrieves database schema including tables, columns, and relationships",
            ToolName::GetSampleData => "Fetches sample rows from specified table to understand data format and values",
            ToolName::SearchMetadata => "Searches business rules and metadata using hybrid lexical and semantic retrieval",
            ToolName::ExecuteSql => "Executes SQL query and returns results",
            ToolName::ValidateResults => "Validates query results for correctness and completeness",
        }
    }
}

/// One recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub tool: ToolName,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A tool selected by `Plan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedTool {
    GetSchema,
    SearchMetadata { top_k: usize },
    GetSampleData { table: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    DetectClarification,
    Plan,
    ExecuteTools(Vec<PlannedTool>),
    GenerateSql,
    Reflect,
    Complete,
    Clarify,
    Failed,
}

impl AgentStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStep::Complete | AgentStep::Clarify | AgentStep::Failed)
    }
}

/// Iteration counter that cannot pass its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    current: u32,
    max: u32,
}

impl IterationBudget {
    /// Starts at iteration 1. A zero ceiling is raised to 1.
    pub fn new(max: u32) -> Self {
        Self {
            current: 1,
            max: max.max(1),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.current
    }

    /// Move to the next iteration if the ceiling allows it.
    pub fn try_advance(&mut self) -> bool {
        if self.current < self.max {
            self.current += 1;
            true
        } else {
            false
        }
    }
}

/// Everything one run knows. Owned by the run and dropped afterwards.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub user_query: String,
    pub resolved_query: String,
    pub execute: bool,
    pub history: Vec<ConversationTurn>,
    pub iteration: IterationBudget,
    pub schema: Option<String>,
    pub retrieved_documents: Vec<RankedResult>,
    pub retrieval_stats: Option<RetrievalStats>,
    /// Depth of the last search attempt, successful or not.
    pub searched_top_k: Option<usize>,
    pub sample_rows: BTreeMap<String, Vec<Row>>,
    /// Tables whose sampling was attempted, successful or not.
    pub sampled_tables: BTreeSet<String>,
    pub context_used: Vec<String>,
    pub generated_sql: Option<String>,
    pub execution_result: Option<ExecutionResult>,
    pub validation_result: Option<ValidationResult>,
    pub reflection_result: Option<ReflectionResult>,
    pub feedback: Option<RefinementFeedback>,
    pub clarification_questions: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub is_complete: bool,
    pub error: Option<String>,
    /// Model text from the latest generation attempt that held no SQL.
    pub raw_output: Option<String>,
}

impl AgentState {
    pub fn new(request: AgentRequest) -> Self {
        Self {
            resolved_query: request
                .resolved_query
                .unwrap_or_else(|| request.query.clone()),
            user_query: request.query,
            execute: request.execute,
            history: request.history,
            iteration: IterationBudget::new(request.max_iterations),
            schema: None,
            retrieved_documents: Vec::new(),
            retrieval_stats: None,
            searched_top_k: None,
            sample_rows: BTreeMap::new(),
            sampled_tables: BTreeSet::new(),
            context_used: Vec::new(),
            generated_sql: None,
            execution_result: None,
            validation_result: None,
            reflection_result: None,
            feedback: None,
            clarification_questions: Vec::new(),
            tool_calls: Vec::new(),
            is_complete: false,
            error: None,
            raw_output: None,
        }
    }

    pub fn needs_clarification(&self) -> bool {
        !self.clarification_questions.is_empty()
    }

    fn record(&mut self, tool: ToolName, success: bool, detail: impl Into<String>) {
        self.tool_calls.push(ToolCall {
            tool,
            success,
            detail: Some(detail.into()),
        });
    }
}

/// Input to one run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub query: String,
    /// Follow-up resolved against `history`; defaults to `query`.
    pub resolved_query: Option<String>,
    pub execute: bool,
    pub max_iterations: u32,
    pub history: Vec<ConversationTurn>,
}

impl AgentRequest {
    pub fn new(query: impl Into<String>, execute: bool, max_iterations: u32) -> Self {
        Self {
            query: query.into(),
            resolved_query: None,
            execute,
            max_iterations,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub top_k: usize,
    pub refine_top_k_step: usize,
    pub clarification: bool,
    pub call_timeout: Duration,
    pub context_turns: usize,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            refine_top_k_step: config.agent.refine_top_k_step,
            clarification: config.agent.clarification,
            call_timeout: config.agent.call_timeout(),
            context_turns: config.conversation.context_turns,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct Agent {
    retriever: Arc<HybridRetriever>,
    catalog: Arc<SchemaCatalog>,
    assembler: ContextAssembler,
    generator: SqlGenerator,
    reflector: Reflector,
    clarifier: ClarificationDetector,
    executor: Arc<dyn SqlExecutor>,
    settings: AgentSettings,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        retriever: Arc<HybridRetriever>,
        catalog: Arc<SchemaCatalog>,
        assembler: ContextAssembler,
        generator: SqlGenerator,
        reflector: Reflector,
        clarifier: ClarificationDetector,
        executor: Arc<dyn SqlExecutor>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            retriever,
            catalog,
            assembler,
            generator,
            reflector,
            clarifier,
            executor,
            settings,
        }
    }

    /// Drive `request` from the first step to a terminal one.
    pub async fn run(&self, request: AgentRequest) -> AgentState {
        let mut state = AgentState::new(request);
        let mut step = if self.settings.clarification {
            AgentStep::DetectClarification
        } else {
            AgentStep::Plan
        };

        while !step.is_terminal() {
            let (next, updated) = self.transition(step, state).await;
            step = next;
            state = updated;
        }

        tracing::info!(
            outcome = ?step,
            iterations = state.iteration.current(),
            tool_calls = state.tool_calls.len(),
            "agent run finished"
        );
        state
    }

    /// Apply one step. Terminal steps are returned unchanged.
    pub async fn transition(&self, step: AgentStep, state: AgentState) -> (AgentStep, AgentState) {
        match step {
            AgentStep::DetectClarification => self.detect_clarification(state).await,
            AgentStep::Plan => self.plan(state),
            AgentStep::ExecuteTools(tools) => self.execute_tools(tools, state).await,
            AgentStep::GenerateSql => self.generate_sql(state).await,
            AgentStep::Reflect => self.reflect(state).await,
            terminal => (terminal, state),
        }
    }

    async fn detect_clarification(&self, mut state: AgentState) -> (AgentStep, AgentState) {
        let verdict = self
            .clarifier
            .detect(&state.resolved_query, &state.history)
            .await;
        if verdict.needs_clarification {
            state.clarification_questions = verdict.questions;
            state.is_complete = true;
            return (AgentStep::Clarify, state);
        }
        (AgentStep::Plan, state)
    }

    /// Search depth wanted at the current iteration.
    fn desired_top_k(&self, state: &AgentState) -> usize {
        self.settings.top_k
            + (state.iteration.current() as usize - 1) * self.settings.refine_top_k_step
    }

    fn plan(&self, state: AgentState) -> (AgentStep, AgentState) {
        let mut tools = Vec::new();

        if state.schema.is_none() {
            tools.push(PlannedTool::GetSchema);
        }
        let top_k = self.desired_top_k(&state);
        if state.searched_top_k != Some(top_k) {
            tools.push(PlannedTool::SearchMetadata { top_k });
        }
        tools.extend(self.unsampled_tables(&state));

        if tools.is_empty() {
            (AgentStep::GenerateSql, state)
        } else {
            tracing::debug!(iteration = state.iteration.current(), ?tools, "planned tools");
            (AgentStep::ExecuteTools(tools), state)
        }
    }

    fn unsampled_tables(&self, state: &AgentState) -> Vec<PlannedTool> {
        if self.assembler.sample_rows_per_table() == 0 {
            return Vec::new();
        }
        identify_relevant_tables(&state.resolved_query, &state.retrieved_documents)
            .into_iter()
            .filter(|t| self.catalog.has_table(t) && !state.sampled_tables.contains(t))
            .map(|table| PlannedTool::GetSampleData { table })
            .collect()
    }

    async fn execute_tools(
        &self,
        tools: Vec<PlannedTool>,
        mut state: AgentState,
    ) -> (AgentStep, AgentState) {
        let mut queue: VecDeque<PlannedTool> = tools.into();

        while let Some(tool) = queue.pop_front() {
            match tool {
                PlannedTool::GetSchema => {
                    state.schema = Some(self.catalog.description.clone());
                    let detail = format!("{} tables", self.catalog.tables.len());
                    state.record(ToolName::GetSchema, true, detail);
                }
                PlannedTool::SearchMetadata { top_k } => {
                    state.searched_top_k = Some(top_k);
                    match self.retriever.retrieve(&state.resolved_query, top_k).await {
                        Ok((results, stats)) => {
                            let detail = format!(
                                "{} documents (lexical {}, semantic {})",
                                results.len(),
                                stats.lexical_count,
                                stats.semantic_count
                            );
                            state.retrieved_documents = results;
                            state.retrieval_stats = Some(stats);
                            state.record(ToolName::SearchMetadata, true, detail);
                            // Newly retrieved documents may point at more tables.
                            for extra in self.unsampled_tables(&state) {
                                if !queue.contains(&extra) {
                                    queue.push_back(extra);
                                }
                            }
                        }
                        Err(e) => state.record(ToolName::SearchMetadata, false, e.to_string()),
                    }
                }
                PlannedTool::GetSampleData { table } => {
                    state.sampled_tables.insert(table.clone());
                    let limit = self.assembler.sample_rows_per_table();
                    match with_timeout(
                        "sample data",
                        self.settings.call_timeout,
                        self.executor.sample_rows(&table, limit),
                    )
                    .await
                    {
                        Ok(rows) => {
                            let detail = format!("{}: {} rows", table, rows.len());
                            state.sample_rows.insert(table, rows);
                            state.record(ToolName::GetSampleData, true, detail);
                        }
                        Err(e) => state.record(
                            ToolName::GetSampleData,
                            false,
                            format!("{}: {}", table, e),
                        ),
                    }
                }
            }
        }

        (AgentStep::GenerateSql, state)
    }

    async fn generate_sql(&self, mut state: AgentState) -> (AgentStep, AgentState) {
        let schema = state
            .schema
            .clone()
            .unwrap_or_else(|| self.catalog.description.clone());
        let context = self
            .assembler
            .assemble(&state.retrieved_documents, &schema, &state.sample_rows);
        state.context_used = context.sections_used;

        let conversation = (!state.history.is_empty())
            .then(|| conversation_context(&state.history, self.settings.context_turns));
        let prompt = build_prompt(
            Method::Agentic,
            PromptInput {
                query: &state.resolved_query,
                context: &context.text,
                conversation: conversation.as_deref(),
                feedback: state.feedback.as_ref(),
            },
        );

        let sql = match self.generator.generate_sql(&prompt).await {
            Ok(sql) => {
                state.raw_output = None;
                sql
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(
                    iteration = state.iteration.current(),
                    error = %e,
                    "generation attempt failed"
                );
                keep_raw_output(&mut state, &e);
                if state.iteration.try_advance() {
                    state.feedback = Some(RefinementFeedback {
                        previous_sql: state.generated_sql.clone().unwrap_or_default(),
                        issues: vec![generation_issue(&e)],
                        execution_error: None,
                    });
                    return (AgentStep::Plan, state);
                }
                return fail(state, &e);
            }
            Err(e) => return fail(state, &e),
        };

        state.generated_sql = Some(sql.clone());
        state.execution_result = None;
        state.validation_result = None;

        if !state.execute {
            return (AgentStep::Reflect, state);
        }

        match with_timeout(
            "SQL execution",
            self.settings.call_timeout,
            self.executor.execute(&sql),
        )
        .await
        {
            Ok(result) => {
                let detail = match (&result.error, result.row_count) {
                    (Some(err), _) => err.clone(),
                    (None, rows) => format!("{} rows", rows.unwrap_or(0)),
                };
                state.record(ToolName::ExecuteSql, result.success, detail);

                let validation = validate(&result);
                state.record(
                    ToolName::ValidateResults,
                    true,
                    format!("overall_valid = {}", validation.overall_valid),
                );
                state.validation_result = Some(validation);
                state.execution_result = Some(result);
                (AgentStep::Reflect, state)
            }
            Err(e) => {
                state.record(ToolName::ExecuteSql, false, e.to_string());
                fail(state, &e)
            }
        }
    }

    async fn reflect(&self, mut state: AgentState) -> (AgentStep, AgentState) {
        let Some(sql) = state.generated_sql.clone() else {
            return fail(
                state,
                &Text2SqlError::Generation {
                    raw: String::new(),
                },
            );
        };

        let remaining = state.iteration.remaining();
        let mut reflection = self
            .reflector
            .reflect(
                &state.resolved_query,
                &sql,
                state.execution_result.as_ref(),
                remaining,
            )
            .await;

        if reflection.should_refine && state.iteration.try_advance() {
            tracing::info!(
                iteration = state.iteration.current(),
                issues = reflection.issues.len(),
                "refining SQL"
            );
            state.feedback = Some(RefinementFeedback {
                previous_sql: sql,
                issues: reflection.issues.clone(),
                execution_error: state
                    .execution_result
                    .as_ref()
                    .and_then(|r| r.error.clone()),
            });
            state.reflection_result = Some(reflection);
            return (AgentStep::Plan, state);
        }

        if !reflection.is_acceptable {
            reflection.should_refine = true;
            reflection.refinement_exhausted = true;
        }
        if let Some(err) = state
            .execution_result
            .as_ref()
            .filter(|r| !r.success)
            .and_then(|r| r.error.clone())
        {
            state.error = Some(format!(
                "query still failing after {} iteration(s): {}",
                state.iteration.current(),
                err
            ));
        }
        state.reflection_result = Some(reflection);
        state.is_complete = true;
        (AgentStep::Complete, state)
    }
}

fn generation_issue(e: &Text2SqlError) -> String {
    match e {
        Text2SqlError::Generation { .. } => {
            "the previous answer contained no SQL statement; return only SQL".to_string()
        }
        other => other.to_string(),
    }
}

fn keep_raw_output(state: &mut AgentState, e: &Text2SqlError) {
    if let Some(raw) = e.raw_output().filter(|raw| !raw.is_empty()) {
        state.raw_output = Some(raw.to_string());
    }
}

fn fail(mut state: AgentState, e: &Text2SqlError) -> (AgentStep, AgentState) {
    tracing::warn!(error = %e, "agent run failed");
    keep_raw_output(&mut state, e);
    state.error = Some(e.to_string());
    state.is_complete = true;
    (AgentStep::Failed, state)
}

/// Name and description of every tool, for listing endpoints.
pub fn tool_catalog() -> Vec<(&'static str, &'static str)> {
    ToolName::ALL
        .iter()
        .map(|t| (t.as_str(), t.description()))
        .collect()
}
