//! SQLite-backed conversation memory with migrations

use crate::classifier::Domain;
use crate::error::{AskflowError, Result};
use crate::memory::{ConversationMemory, Exchange};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;

type DbPool = Pool<SqliteConnectionManager>;

/// Chat log store shared across pool connections
pub struct SqliteConversationMemory {
    pool: DbPool,
    max_turns: usize,
}

impl SqliteConversationMemory {
    pub fn open(db_path: &Path, max_turns: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AskflowError::Io {
                source: e,
                context: format!("Failed to create memory directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| AskflowError::Config(format!("Failed to create connection pool: {}", e)))?;

        let memory = Self {
            pool,
            max_turns: max_turns.max(1),
        };
        memory.migrate()?;
        Ok(memory)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AskflowError::Config(format!("Failed to get connection: {}", e)))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying memory migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }
}

impl ConversationMemory for SqliteConversationMemory {
    fn append(&self, session_id: &str, exchange: Exchange) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO chat_logs (session_id, question, answer, domain, asked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                exchange.question,
                exchange.answer,
                exchange.domain.map(|d| d.to_string()),
                exchange.asked_at.to_rfc3339(),
            ],
        )?;

        // Keep only the newest turns of this session
        tx.execute(
            "DELETE FROM chat_logs WHERE session_id = ?1 AND id NOT IN (
                SELECT id FROM chat_logs WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
            )",
            params![session_id, self.max_turns as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<Exchange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT question, answer, domain, asked_at FROM chat_logs
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            let domain: Option<String> = row.get(2)?;
            let asked_at: String = row.get(3)?;
            Ok(Exchange {
                question: row.get(0)?,
                answer: row.get(1)?,
                domain: domain.and_then(|d| d.parse::<Domain>().ok()),
                asked_at: DateTime::parse_from_rfc3339(&asked_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;

        let mut exchanges = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        exchanges.reverse();
        Ok(exchanges)
    }
}

const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE chat_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        domain TEXT,
        asked_at TEXT NOT NULL
    );

    CREATE INDEX idx_chat_logs_session ON chat_logs(session_id, id);
    "#];
