//! The four text-to-SQL variants behind one façade.
//!
//! | Variant    | Context                                         |
//! |------------|-------------------------------------------------|
//! | `simple`   | schema only                                     |
//! | `advanced` | schema, sample rows, hybrid-retrieved rules     |
//! | `chat`     | `advanced` plus session history and follow-ups  |
//! | `agentic`  | tool-using [`Agent`] with reflection            |
//!
//! Every variant answers with a [`Text2SqlResponse`]. Failures that leave
//! no SQL are reported in its `error` field, never as an `Err`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::agent::{tool_catalog, Agent, AgentRequest, AgentSettings};
use crate::clarification::ClarificationDetector;
use crate::config::Config;
use crate::context::{identify_relevant_tables, ContextAssembler};
use crate::conversation::{
    conversation_context, resolve_followup, InMemorySessionStore, SessionLocks, SessionStore,
};
use crate::corpus::{self, SchemaCatalog};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{with_timeout, Result, Text2SqlError};
use crate::executor::{SqlExecutor, SqliteExecutor, UnavailableExecutor};
use crate::generation::{build_prompt, PromptInput, SqlGenerator};
use crate::llm::{create_model, LanguageModel};
use crate::models::{
    ConversationTurn, Document, ExecutionResult, Method, RankedResult, ReflectionResult,
    RetrievalSource, RetrievalStats, Row, ValidationResult,
};
use crate::reflection::Reflector;
use crate::retriever::HybridRetriever;

/// Upper bound accepted for a caller-supplied `max_iterations`.
pub const MAX_ITERATIONS_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct Text2SqlRequest {
    pub query: String,
    #[serde(default)]
    pub execute: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl Text2SqlRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            execute: false,
            session_id: None,
            max_iterations: None,
        }
    }

    /// Reject requests no variant can serve.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.query.trim().is_empty() {
            return Err("query must not be empty".to_string());
        }
        if let Some(n) = self.max_iterations {
            if !(1..=MAX_ITERATIONS_LIMIT).contains(&n) {
                return Err(format!(
                    "max_iterations must be between 1 and {}",
                    MAX_ITERATIONS_LIMIT
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Text2SqlResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection_result: Option<ReflectionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_clarification: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification_questions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_stats: Option<RetrievalStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// What the model said when no SQL could be extracted from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_model_output: Option<String>,
}

impl Text2SqlResponse {
    fn record_failure(&mut self, e: &Text2SqlError) {
        self.error = Some(e.to_string());
        self.raw_model_output = e.raw_output().map(str::to_string);
    }

    pub fn new(method: Method) -> Self {
        Self {
            sql: None,
            method,
            session_id: None,
            resolved_query: None,
            context_used: None,
            iterations: None,
            tool_calls: None,
            execution_result: None,
            validation_result: None,
            reflection_result: None,
            needs_clarification: None,
            clarification_questions: None,
            retrieval_stats: None,
            parsed_response: None,
            error: None,
            raw_model_output: None,
        }
    }
}

/// One retrieval hit as returned by [`Text2SqlService::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub table: String,
    pub section: String,
    pub content: String,
    pub score: f64,
    pub source: RetrievalSource,
}

impl From<&RankedResult> for SearchHit {
    fn from(r: &RankedResult) -> Self {
        Self {
            id: r.document.id.clone(),
            table: r.document.table.clone(),
            section: r.document.section.clone(),
            content: r.document.content.clone(),
            score: r.score,
            source: r.source,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub stats: RetrievalStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Static facts about the loaded corpus and collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusInfo {
    pub documents: usize,
    pub tables: Vec<String>,
    pub fingerprint: String,
    pub semantic_enabled: bool,
    pub model: String,
}

/// Collaborators a service is assembled from.
pub struct ServiceParts {
    pub documents: Vec<Document>,
    pub catalog: SchemaCatalog,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub model: Arc<dyn LanguageModel>,
    pub executor: Arc<dyn SqlExecutor>,
    pub sessions: Arc<dyn SessionStore>,
}

pub struct Text2SqlService {
    retriever: Arc<HybridRetriever>,
    catalog: Arc<SchemaCatalog>,
    assembler: ContextAssembler,
    generator: SqlGenerator,
    agent: Agent,
    executor: Arc<dyn SqlExecutor>,
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    fingerprint: String,
    top_k: usize,
    max_iterations: u32,
    context_turns: usize,
    call_timeout: Duration,
}

impl Text2SqlService {
    /// Build every collaborator named in `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let documents = match &config.corpus.path {
            Some(path) => corpus::load_documents(path)?,
            None => corpus::builtin_documents(),
        };
        let catalog = SchemaCatalog::builtin();

        let embedder = if config.embedding.is_enabled() {
            Some(create_embedder(&config.embedding).context("Failed to create embedder")?)
        } else {
            None
        };
        let model = create_model(&config.llm).context("Failed to create language model")?;

        let executor: Arc<dyn SqlExecutor> = match &config.database.path {
            Some(path) => Arc::new(
                SqliteExecutor::connect(path, catalog.clone(), config.database.max_rows)
                    .await
                    .context("Failed to open database")?,
            ),
            None => {
                tracing::warn!("no [database] path configured; execution disabled");
                Arc::new(UnavailableExecutor)
            }
        };
        let sessions = Arc::new(InMemorySessionStore::new(config.conversation.max_turns));

        let service = Self::new(
            config,
            ServiceParts {
                documents,
                catalog,
                embedder,
                model,
                executor,
                sessions,
            },
        )
        .await
        .context("Failed to build retrieval indices")?;
        Ok(service)
    }

    /// Assemble a service from explicit collaborators.
    pub async fn new(config: &Config, parts: ServiceParts) -> Result<Self> {
        let documents = corpus::freeze(parts.documents)?;
        let fingerprint = corpus::fingerprint(&documents);
        let call_timeout = config.agent.call_timeout();

        let retriever = Arc::new(
            HybridRetriever::build(
                documents,
                &config.retrieval,
                &config.embedding,
                parts.embedder,
                call_timeout,
            )
            .await?,
        );
        let catalog = Arc::new(parts.catalog);
        let assembler = ContextAssembler::from_config(&config.context);
        let generator = SqlGenerator::new(parts.model.clone(), call_timeout);

        let agent = Agent::new(
            retriever.clone(),
            catalog.clone(),
            assembler.clone(),
            generator.clone(),
            Reflector::new(parts.model.clone(), call_timeout),
            ClarificationDetector::new(parts.model, call_timeout),
            parts.executor.clone(),
            AgentSettings::from_config(config),
        );

        tracing::info!(
            documents = retriever.documents().len(),
            semantic = retriever.semantic_enabled(),
            model = generator.model_name(),
            "text2sql service ready"
        );

        Ok(Self {
            retriever,
            catalog,
            assembler,
            generator,
            agent,
            executor: parts.executor,
            sessions: parts.sessions,
            locks: SessionLocks::new(),
            fingerprint,
            top_k: config.retrieval.top_k,
            max_iterations: config.agent.max_iterations,
            context_turns: config.conversation.context_turns,
            call_timeout,
        })
    }

    pub async fn run(&self, method: Method, request: Text2SqlRequest) -> Text2SqlResponse {
        match method {
            Method::Simple => self.simple(request).await,
            Method::Advanced => self.advanced(request).await,
            Method::Chat => self.chat(request).await,
            Method::Agentic => self.agentic(request).await,
        }
    }

    /// Schema-only prompting.
    pub async fn simple(&self, request: Text2SqlRequest) -> Text2SqlResponse {
        let mut response = Text2SqlResponse::new(Method::Simple);
        let prompt = build_prompt(
            Method::Simple,
            PromptInput::new(&request.query, &self.catalog.description),
        );
        match self.generator.generate_sql(&prompt).await {
            Ok(sql) => {
                self.execute_into(&request, &sql, &mut response).await;
                response.sql = Some(sql);
            }
            Err(e) => response.record_failure(&e),
        }
        response
    }

    /// Retrieval-augmented prompting.
    pub async fn advanced(&self, request: Text2SqlRequest) -> Text2SqlResponse {
        let mut response = Text2SqlResponse::new(Method::Advanced);
        let (context, retrieved) = self.retrieve_context(&request.query, &mut response).await;
        let prompt = build_prompt(Method::Advanced, PromptInput::new(&request.query, &context));
        response.context_used = Some(retrieved);

        match self.generator.generate_sql(&prompt).await {
            Ok(sql) => {
                self.execute_into(&request, &sql, &mut response).await;
                response.sql = Some(sql);
            }
            Err(e) => response.record_failure(&e),
        }
        response
    }

    /// Retrieval-augmented prompting with session history.
    pub async fn chat(&self, request: Text2SqlRequest) -> Text2SqlResponse {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let _run = self.locks.acquire(&session_id).await;

        let mut response = Text2SqlResponse::new(Method::Chat);
        response.session_id = Some(session_id.clone());

        let history = self.history(&session_id).await;
        let resolved = resolve_followup(&request.query, &history);
        if resolved != request.query {
            response.resolved_query = Some(resolved.clone());
        }

        let (context, retrieved) = self.retrieve_context(&resolved, &mut response).await;
        response.context_used = Some(retrieved);
        let conversation = conversation_context(&history, self.context_turns);
        let prompt = build_prompt(
            Method::Chat,
            PromptInput {
                query: &request.query,
                context: &context,
                conversation: Some(&conversation),
                feedback: None,
            },
        );

        match self.generator.generate_sql(&prompt).await {
            Ok(sql) => {
                self.execute_into(&request, &sql, &mut response).await;
                self.remember(&session_id, &request.query, &resolved, &sql)
                    .await;
                response.sql = Some(sql);
            }
            Err(e) => response.record_failure(&e),
        }
        response
    }

    /// Tool-using agent with reflection.
    pub async fn agentic(&self, request: Text2SqlRequest) -> Text2SqlResponse {
        let mut response = Text2SqlResponse::new(Method::Agentic);

        let _run = match &request.session_id {
            Some(id) => Some(self.locks.acquire(id).await),
            None => None,
        };
        let history = match &request.session_id {
            Some(id) => self.history(id).await,
            None => Vec::new(),
        };
        let resolved = resolve_followup(&request.query, &history);
        if resolved != request.query {
            response.resolved_query = Some(resolved.clone());
        }
        response.session_id = request.session_id.clone();

        let state = self
            .agent
            .run(AgentRequest {
                query: request.query.clone(),
                resolved_query: Some(resolved.clone()),
                execute: request.execute,
                max_iterations: request.max_iterations.unwrap_or(self.max_iterations),
                history,
            })
            .await;

        if state.needs_clarification() {
            response.needs_clarification = Some(true);
            response.clarification_questions = Some(state.clarification_questions);
            return response;
        }

        response.needs_clarification = Some(false);
        response.iterations = Some(state.iteration.current());
        response.tool_calls = Some(state.tool_calls.len());
        response.context_used = Some(state.context_used);
        response.retrieval_stats = state.retrieval_stats;
        response.validation_result = state.validation_result;
        response.reflection_result = state.reflection_result;
        response.error = state.error;
        response.raw_model_output = state.raw_output;

        if let (Some(sql), Some(result)) = (&state.generated_sql, &state.execution_result) {
            response.parsed_response = self
                .generator
                .summarize_results(&request.query, sql, result)
                .await;
        }
        response.execution_result = state.execution_result;

        if let (Some(id), Some(sql)) = (&request.session_id, &state.generated_sql) {
            self.remember(id, &request.query, &resolved, sql).await;
        }
        response.sql = state.generated_sql;
        response
    }

    /// Retrieval only.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<SearchResponse> {
        let (results, stats) = self
            .retriever
            .retrieve(query, top_k.unwrap_or(self.top_k))
            .await?;
        Ok(SearchResponse {
            query: query.to_string(),
            results: results.iter().map(SearchHit::from).collect(),
            stats,
        })
    }

    /// Run caller-supplied SQL through the executor.
    pub async fn execute_raw(&self, sql: &str) -> ExecutionResult {
        self.run_sql(sql).await
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<bool> {
        let _run = self.locks.acquire(session_id).await;
        self.sessions.clear(session_id).await
    }

    pub async fn session_history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        self.sessions.get_history(session_id).await
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        tool_catalog()
            .into_iter()
            .map(|(name, description)| ToolInfo { name, description })
            .collect()
    }

    pub fn corpus_info(&self) -> CorpusInfo {
        CorpusInfo {
            documents: self.retriever.documents().len(),
            tables: self.catalog.tables.clone(),
            fingerprint: self.fingerprint.clone(),
            semantic_enabled: self.retriever.semantic_enabled(),
            model: self.generator.model_name().to_string(),
        }
    }

    pub fn documents(&self) -> &[Arc<Document>] {
        self.retriever.documents()
    }

    /// Retrieve, sample and assemble. Returns the context text and the
    /// sections that made it in. Retrieval failure leaves a schema-only
    /// context.
    async fn retrieve_context(
        &self,
        query: &str,
        response: &mut Text2SqlResponse,
    ) -> (String, Vec<String>) {
        let retrieved = match self.retriever.retrieve(query, self.top_k).await {
            Ok((results, stats)) => {
                response.retrieval_stats = Some(stats);
                results
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, using schema-only context");
                Vec::new()
            }
        };

        let mut samples: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        if self.assembler.sample_rows_per_table() > 0 {
            for table in identify_relevant_tables(query, &retrieved) {
                if !self.catalog.has_table(&table) {
                    continue;
                }
                match with_timeout(
                    "sample data",
                    self.call_timeout,
                    self.executor
                        .sample_rows(&table, self.assembler.sample_rows_per_table()),
                )
                .await
                {
                    Ok(rows) => {
                        samples.insert(table, rows);
                    }
                    Err(e) => tracing::debug!(table, error = %e, "no sample rows"),
                }
            }
        }

        let context = self
            .assembler
            .assemble(&retrieved, &self.catalog.description, &samples);
        (context.text, context.sections_used)
    }

    async fn run_sql(&self, sql: &str) -> ExecutionResult {
        match with_timeout("SQL execution", self.call_timeout, self.executor.execute(sql)).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure(e.to_string()),
        }
    }

    /// Execute when asked, and summarize a successful result.
    async fn execute_into(
        &self,
        request: &Text2SqlRequest,
        sql: &str,
        response: &mut Text2SqlResponse,
    ) {
        if !request.execute {
            return;
        }
        let result = self.run_sql(sql).await;
        response.parsed_response = self
            .generator
            .summarize_results(&request.query, sql, &result)
            .await;
        response.execution_result = Some(result);
    }

    async fn history(&self, session_id: &str) -> Vec<ConversationTurn> {
        match self.sessions.get_history(session_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "session history unavailable");
                Vec::new()
            }
        }
    }

    async fn remember(&self, session_id: &str, query: &str, resolved: &str, sql: &str) {
        let turn = ConversationTurn {
            session_id: session_id.to_string(),
            user_query: query.to_string(),
            resolved_query: resolved.to_string(),
            generated_sql: sql.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.sessions.append(session_id, turn).await {
            tracing::warn!(session_id, error = %e, "failed to record conversation turn");
        }
    }
}
