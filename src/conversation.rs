//! Conversation state: bounded per-session history and follow-up resolution.
//!
//! Sessions are reached only through the [`SessionStore`] trait. The
//! in-memory store serializes writes per session and keeps sessions
//! independent of each other; [`SessionLocks`] additionally serializes whole
//! chat/agent runs for one session so turns land in request order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::lexical::tokenize;
use crate::models::ConversationTurn;

/// Queries with this many words or more are never treated as follow-ups.
pub const MAX_FOLLOWUP_WORDS: usize = 10;

/// Phrases that, at the start of a short query, mark it as a follow-up.
const FOLLOWUP_PHRASES: &[&str] = &[
    "what about",
    "how about",
    "and for",
    "and in",
    "and what about",
    "same for",
    "same but",
    "now for",
    "now show",
    "show me",
    "only",
    "just",
    "what if",
    "instead",
];

/// Tokens that refer back to something named in an earlier turn.
const REFERENT_TOKENS: &[&str] = &["they", "them", "those", "these", "that", "it", "its", "their"];

/// Which rule marked a query as a follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowupRule {
    LeadingPhrase(&'static str),
    Referent(&'static str),
}

/// Classify `query` against the follow-up rule table. History is not
/// consulted here.
pub fn followup_rule(query: &str) -> Option<FollowupRule> {
    if query.split_whitespace().count() >= MAX_FOLLOWUP_WORDS {
        return None;
    }
    let lower = query.trim().to_lowercase();

    for phrase in FOLLOWUP_PHRASES {
        if let Some(rest) = lower.strip_prefix(phrase) {
            if rest.chars().next().map_or(true, |c| !c.is_alphanumeric()) {
                return Some(FollowupRule::LeadingPhrase(*phrase));
            }
        }
    }

    let tokens = tokenize(&lower);
    REFERENT_TOKENS
        .iter()
        .find(|r| tokens.iter().any(|t| t.as_str() == **r))
        .map(|r| FollowupRule::Referent(*r))
}

/// Expand a follow-up with the most recent turn's question. Anything that is
/// not a follow-up, or has no history to lean on, is returned unchanged.
pub fn resolve_followup(query: &str, history: &[ConversationTurn]) -> String {
    match (history.last(), followup_rule(query)) {
        (Some(last), Some(rule)) => {
            tracing::debug!(?rule, "resolved follow-up query");
            format!("{}. Additionally: {}", last.user_query, query)
        }
        _ => query.to_string(),
    }
}

/// Render the last `turns` turns for a prompt. Generated SQL is cut at 200
/// characters.
pub fn conversation_context(history: &[ConversationTurn], turns: usize) -> String {
    if history.is_empty() {
        return "Conversation History: None (this is the first question)".to_string();
    }
    let start = history.len().saturating_sub(turns);
    let mut out = String::from("Conversation History:\n");
    for (i, turn) in history[start..].iter().enumerate() {
        let sql: String = turn.generated_sql.chars().take(200).collect();
        let ellipsis = if turn.generated_sql.chars().count() > 200 {
            "..."
        } else {
            ""
        };
        out.push_str(&format!("\nTurn {}:\n", i + 1));
        out.push_str(&format!("  User asked: {}\n", turn.user_query));
        out.push_str(&format!("  Generated SQL: {}{}\n", sql, ellipsis));
    }
    out
}

/// Storage for conversation turns.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Turns for `session_id`, oldest first. Unknown sessions are empty.
    async fn get_history(&self, session_id: &str) -> Result<Vec<ConversationTurn>>;
    /// Append a turn, evicting the oldest beyond the retention limit.
    async fn append(&self, session_id: &str, turn: ConversationTurn) -> Result<()>;
    /// Drop a session. Returns whether it existed.
    async fn clear(&self, session_id: &str) -> Result<bool>;
}

type SessionHistory = Arc<Mutex<VecDeque<ConversationTurn>>>;

/// Process-local [`SessionStore`].
pub struct InMemorySessionStore {
    max_turns: usize,
    sessions: Mutex<HashMap<String, SessionHistory>>,
}

impl InMemorySessionStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns: max_turns.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn session(&self, session_id: &str) -> SessionHistory {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        match session {
            Some(history) => Ok(history.lock().await.iter().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn append(&self, session_id: &str, mut turn: ConversationTurn) -> Result<()> {
        let session = self.session(session_id).await;
        let mut history = session.lock().await;

        if let Some(last) = history.back() {
            if turn.timestamp <= last.timestamp {
                turn.timestamp = last.timestamp + ChronoDuration::microseconds(1);
            }
        }
        turn.session_id = session_id.to_string();
        history.push_back(turn);
        while history.len() > self.max_turns {
            history.pop_front();
        }
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.lock().await.remove(session_id);
        match removed {
            Some(history) => {
                history.lock().await.clear();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Per-session run locks. Holding the guard keeps other runs for the same
/// session waiting; other sessions are unaffected.
#[derive(Default)]
pub struct SessionLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Forget locks nobody is holding or waiting on.
            if locks.len() > 1024 {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
