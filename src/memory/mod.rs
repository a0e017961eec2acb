//! Conversation memory
//!
//! History is append-only and read oldest first. The engine only ever appends
//! and reads; trimming to `max_turns_per_session` is the store's concern.

mod sqlite;

pub use sqlite::SqliteConversationMemory;

use crate::classifier::Domain;
use crate::config::MemoryConfig;
use crate::error::{AskflowError, Result};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One question/answer pair of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
    /// Domain the answer was produced from
    pub domain: Option<Domain>,
    pub asked_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(question: impl Into<String>, answer: impl Into<String>, domain: Option<Domain>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            domain,
            asked_at: Utc::now(),
        }
    }
}

/// Bounded per-session history
pub trait ConversationMemory: Send + Sync {
    fn append(&self, session_id: &str, exchange: Exchange) -> Result<()>;

    /// Up to `limit` most recent exchanges, oldest first
    fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<Exchange>>;
}

type History = Arc<Mutex<VecDeque<Exchange>>>;

/// Process-local memory
///
/// Holds at most `max_sessions` sessions and forgets a session once it has
/// been idle for `session_idle`.
pub struct InMemoryConversationMemory {
    sessions: Cache<String, History>,
    max_turns: usize,
}

impl InMemoryConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self::with_limits(max_turns, 10_000, Duration::from_secs(86_400))
    }

    pub fn with_limits(max_turns: usize, max_sessions: u64, session_idle: Duration) -> Self {
        Self {
            sessions: Cache::builder()
                .max_capacity(max_sessions.max(1))
                .time_to_idle(session_idle)
                .build(),
            max_turns: max_turns.max(1),
        }
    }

    /// Sessions currently held, after pending evictions
    pub fn session_count(&self) -> u64 {
        self.sessions.run_pending_tasks();
        self.sessions.entry_count()
    }
}

fn lock_poisoned<T>(_: T) -> AskflowError {
    AskflowError::Other(anyhow::anyhow!("conversation memory lock poisoned"))
}

impl ConversationMemory for InMemoryConversationMemory {
    fn append(&self, session_id: &str, exchange: Exchange) -> Result<()> {
        let history = self
            .sessions
            .get_with(session_id.to_string(), || Arc::new(Mutex::new(VecDeque::new())));
        let mut history = history.lock().map_err(lock_poisoned)?;

        history.push_back(exchange);
        while history.len() > self.max_turns {
            history.pop_front();
        }
        Ok(())
    }

    fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<Exchange>> {
        let Some(history) = self.sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        let history = history.lock().map_err(lock_poisoned)?;

        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }
}

/// Build the backend named in configuration
pub fn open_memory(config: &MemoryConfig, db_path: &Path) -> Result<Arc<dyn ConversationMemory>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryConversationMemory::with_limits(
            config.max_turns_per_session,
            config.max_sessions,
            config.session_idle_duration(),
        ))),
        "sqlite" => Ok(Arc::new(SqliteConversationMemory::open(
            db_path,
            config.max_turns_per_session,
        )?)),
        other => Err(AskflowError::InvalidConfigValue {
            path: "memory.backend".to_string(),
            message: format!("Unknown memory backend '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_is_oldest_first() {
        let memory = InMemoryConversationMemory::new(10);
        for i in 0..4 {
            memory
                .append("s1", Exchange::new(format!("q{}", i), format!("a{}", i), None))
                .unwrap();
        }

        let recent = memory.recent("s1", 2).unwrap();
        let questions: Vec<&str> = recent.iter().map(|e| e.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3"]);
    }

    #[test]
    fn test_sessions_are_bounded_and_isolated() {
        let memory = InMemoryConversationMemory::new(3);
        for i in 0..5 {
            memory
                .append("s1", Exchange::new(format!("q{}", i), "a", Some(Domain::Technical)))
                .unwrap();
        }
        memory.append("s2", Exchange::new("other", "a", None)).unwrap();

        let recent = memory.recent("s1", 10).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].question, "q2");
        assert_eq!(memory.recent("s2", 10).unwrap().len(), 1);
        assert!(memory.recent("unknown", 10).unwrap().is_empty());
    }

    #[test]
    fn test_session_count_is_capped() {
        let memory = InMemoryConversationMemory::with_limits(5, 4, Duration::from_secs(3600));
        for i in 0..50 {
            memory
                .append(&format!("session-{}", i), Exchange::new("q", "a", None))
                .unwrap();
        }
        assert!(memory.session_count() <= 4);
    }

    #[test]
    fn test_idle_sessions_are_forgotten() {
        let memory = InMemoryConversationMemory::with_limits(5, 100, Duration::from_millis(50));
        memory.append("s1", Exchange::new("q", "a", None)).unwrap();
        assert_eq!(memory.recent("s1", 5).unwrap().len(), 1);

        std::thread::sleep(Duration::from_millis(120));
        assert!(memory.recent("s1", 5).unwrap().is_empty());
        assert_eq!(memory.session_count(), 0);
    }

    #[test]
    fn test_unknown_backend() {
        let mut config = crate::config::Config::default().memory;
        config.backend = "redis".to_string();
        assert!(open_memory(&config, Path::new("unused.db")).is_err());
    }
}
