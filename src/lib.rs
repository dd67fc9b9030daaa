//! # Text2SQL Harness
//!
//! Natural-language questions about a nuclear power plant database turned
//! into SQLite queries.
//!
//! Business rules ("operational means StatusId = 3", capacity units, country
//! codes) live in a small document corpus. Each question retrieves the
//! relevant rules with hybrid BM25 + embedding search, assembles them with the
//! schema and sample rows into a bounded prompt, and asks a language model for
//! SQL. The agentic variant wraps this in a tool-using state machine that
//! executes, validates and reflects on its own output before answering.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌──────────────┐
//! │  Corpus  │──▶│ Hybrid search  │──▶│   Context    │
//! │  rules   │   │ BM25 + vectors │   │  assembler   │
//! └──────────┘   └────────────────┘   └──────┬───────┘
//!                                            ▼
//!  ┌──────────┐   ┌────────────────┐   ┌──────────────┐
//!  │ Sessions │──▶│ Agent / service│──▶│ LLM + SQLite │
//!  └──────────┘   └───────┬────────┘   └──────────────┘
//!                 ┌───────┴────────┐
//!                 ▼                ▼
//!            ┌─────────┐     ┌──────────┐
//!            │   CLI   │     │   HTTP   │
//!            │  (t2s)  │     │  (axum)  │
//!            └─────────┘     └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`corpus`] | Built-in business rules and schema catalog |
//! | [`lexical`] | BM25 index |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`semantic`] | Vector index |
//! | [`retriever`] | Rank fusion of lexical and semantic results |
//! | [`context`] | Prompt context assembly |
//! | [`llm`] | Language model clients |
//! | [`generation`] | Prompt templates and SQL extraction |
//! | [`reflection`] | Result validation and self-critique |
//! | [`clarification`] | Ambiguity detection |
//! | [`conversation`] | Session history and follow-up resolution |
//! | [`executor`] | Read-only SQL execution |
//! | [`agent`] | Tool-using agent state machine |
//! | [`service`] | The four generation variants |
//! | [`server`] | HTTP API |

pub mod agent;
pub mod clarification;
pub mod config;
pub mod context;
pub mod conversation;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod generation;
mod http;
pub mod lexical;
pub mod llm;
pub mod models;
pub mod reflection;
pub mod retriever;
pub mod semantic;
pub mod server;
pub mod service;
