//! # Text2SQL Harness CLI (`t2s`)
//!
//! ## Usage
//!
//! ```bash
//! t2s --config ./config/t2s.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `t2s serve` | Start the HTTP API |
//! | `t2s ask "<question>"` | Generate (and optionally run) SQL for a question |
//! | `t2s search "<query>"` | Show retrieved business rules |
//! | `t2s corpus` | Summarize the loaded corpus |
//! | `t2s tools` | List the agent's tools |
//!
//! ## Examples
//!
//! ```bash
//! t2s ask "How many operational plants are in France?" --method agentic --execute
//! t2s search "operational status" --top-k 3
//! RUST_LOG=debug t2s serve
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use text2sql_harness::config;
use text2sql_harness::models::Method;
use text2sql_harness::server;
use text2sql_harness::service::{Text2SqlRequest, Text2SqlService};

/// Natural-language to SQL over a nuclear power plant database.
#[derive(Parser)]
#[command(name = "t2s", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/t2s.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Turn a question into SQL.
    Ask {
        /// The question, in plain language.
        query: String,

        /// `simple`, `advanced`, `chat` or `agentic`.
        #[arg(long, default_value = "advanced", value_parser = parse_method)]
        method: Method,

        /// Run the generated SQL against `[database].path`.
        #[arg(long)]
        execute: bool,

        /// Session id for `chat` and `agentic`.
        #[arg(long)]
        session: Option<String>,

        /// Agent iteration ceiling (1-10).
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Retrieve business rules for a query.
    Search {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Summarize the loaded corpus and collaborators.
    Corpus,

    /// List the agent's tools.
    Tools,
}

fn parse_method(s: &str) -> Result<Method, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ask {
            query,
            method,
            execute,
            session,
            max_iterations,
        } => {
            let request = Text2SqlRequest {
                query,
                execute,
                session_id: session,
                max_iterations,
            };
            if let Err(msg) = request.validate() {
                anyhow::bail!(msg);
            }
            let service = Text2SqlService::from_config(&cfg).await?;
            let response = service.run(method, request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Search { query, top_k } => {
            if query.trim().is_empty() {
                anyhow::bail!("query must not be empty");
            }
            let service = Text2SqlService::from_config(&cfg).await?;
            let response = service.search(&query, top_k).await?;
            if response.results.is_empty() {
                println!("No results.");
            }
            for (i, hit) in response.results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} ({:?})",
                    i + 1,
                    hit.score,
                    hit.id,
                    hit.source
                );
                println!("   {}", hit.content);
            }
            println!(
                "\nlexical: {}  semantic: {}  fused: {}",
                response.stats.lexical_count,
                response.stats.semantic_count,
                response.stats.merged_count
            );
        }
        Commands::Corpus => {
            let service = Text2SqlService::from_config(&cfg).await?;
            let info = service.corpus_info();
            println!("documents:   {}", info.documents);
            println!("tables:      {}", info.tables.join(", "));
            println!("fingerprint: {}", info.fingerprint);
            println!("semantic:    {}", info.semantic_enabled);
            println!("model:       {}", info.model);
            for doc in service.documents() {
                println!("  {}", doc.id);
            }
        }
        Commands::Tools => {
            let service = Text2SqlService::from_config(&cfg).await?;
            for tool in service.tools() {
                println!("{:<18} {}", tool.name, tool.description);
            }
        }
    }

    Ok(())
}
