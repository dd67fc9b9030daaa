use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Each index is asked for `candidate_multiplier × top_k` candidates.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Semantic hits at or below this cosine similarity are dropped.
    #[serde(default)]
    pub min_similarity: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            min_similarity: 0.0,
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_candidate_multiplier() -> usize {
    2
}
fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_sample_rows")]
    pub sample_rows_per_table: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            sample_rows_per_table: default_sample_rows(),
        }
    }
}

fn default_max_chars() -> usize {
    12_000
}
fn default_sample_rows() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Deadline for each model, embedding and execution call.
    #[serde(default = "default_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub clarification: bool,
    /// Extra documents requested per refinement iteration.
    #[serde(default = "default_refine_step")]
    pub refine_top_k_step: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            call_timeout_secs: default_timeout_secs(),
            clarification: true,
            refine_top_k_step: default_refine_step(),
        }
    }
}

impl AgentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_max_iterations() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_refine_step() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Turns rendered into the prompt's conversation section.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            context_turns: default_context_turns(),
        }
    }
}

fn default_max_turns() -> usize {
    10
}
fn default_context_turns() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// SQLite file holding the plant data. Opened read-only.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

fn default_max_rows() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CorpusConfig {
    /// JSON file with `[{"table", "section", "content"}]`; built-in corpus when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier == 0 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.bm25_b) || config.retrieval.bm25_k1 < 0.0 {
        anyhow::bail!("retrieval.bm25_b must be in [0.0, 1.0] and bm25_k1 >= 0");
    }

    // Agent
    if !(1..=10).contains(&config.agent.max_iterations) {
        anyhow::bail!("agent.max_iterations must be in 1..=10");
    }
    if config.agent.call_timeout_secs == 0 {
        anyhow::bail!("agent.call_timeout_secs must be > 0");
    }

    if config.conversation.max_turns == 0 {
        anyhow::bail!("conversation.max_turns must be > 0");
    }
    if config.context.max_chars == 0 {
        anyhow::bail!("context.max_chars must be > 0");
    }

    // Embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.provider != "hash" && config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hash.",
            other
        ),
    }

    // LLM
    match config.llm.provider.as_str() {
        "disabled" => {}
        "anthropic" | "openai" => {
            if config.llm.model.is_none() {
                anyhow::bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, anthropic, or openai.",
            other
        ),
    }

    Ok(())
}
