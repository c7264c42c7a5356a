//! State Tracker
//!
//! Persistent storage for the consensus hard state: current term,
//! vote and commit index. Owned by the consensus task, so access is
//! synchronous.

use std::path::PathBuf;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::wal::{LogIndex, Term};

/// State that must survive a restart before any message depending on it is sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<String>,
    pub commit_index: LogIndex,
}

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    conn: Connection,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("state.db"))?;
        Self::init(conn)
    }

    /// Volatile tracker for simulations and tests
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row(
                "SELECT value_int FROM node_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn get_text(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value_text FROM node_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// Load the persisted hard state (all zero on a fresh node)
    pub fn load(&self) -> Result<HardState> {
        Ok(HardState {
            current_term: self.get_int("current_term")?.unwrap_or(0) as Term,
            voted_for: self.get_text("voted_for")?,
            commit_index: self.get_int("commit_index")?.unwrap_or(0) as LogIndex,
        })
    }

    /// Persist the hard state atomically
    pub fn save(&mut self, state: &HardState) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO node_state (key, value_int) VALUES ('current_term', ?1)
            ON CONFLICT(key) DO UPDATE SET value_int = ?1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![state.current_term as i64],
        )?;
        match &state.voted_for {
            Some(id) => {
                tx.execute(
                    r#"
                    INSERT INTO node_state (key, value_text) VALUES ('voted_for', ?1)
                    ON CONFLICT(key) DO UPDATE SET value_text = ?1, updated_at = CURRENT_TIMESTAMP
                    "#,
                    params![id],
                )?;
            }
            None => {
                tx.execute("DELETE FROM node_state WHERE key = 'voted_for'", [])?;
            }
        }
        tx.execute(
            r#"
            INSERT INTO node_state (key, value_int) VALUES ('commit_index', ?1)
            ON CONFLICT(key) DO UPDATE SET value_int = ?1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![state.commit_index as i64],
        )?;
        tx.commit()?;
        Ok(())
    }
}
