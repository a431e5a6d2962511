//! Persistence layer
//!
//! A single SQLite database holds every durable entity. All writers go
//! through one connection behind a mutex, so multi-statement read-modify
//! -write sequences are serialized; state transitions are still written
//! as guarded single-statement updates (`WHERE id = ? AND status = ?`)
//! so there is no unguarded check-then-update path anywhere.

mod courses;
mod deployments;
mod events;
mod fiches;
mod jobs;
mod runners;
mod schema;
mod threads;

pub use deployments::DeployStateCounts;
pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
    #[error("{0}")]
    Conflict(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ==================== User Operations ====================

    /// Create a user with a pre-hashed API token
    pub fn create_user(&self, email: &str, api_token_hash: &str) -> DbResult<User> {
        let conn = self.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO users (email, api_token_hash, created_at) VALUES (?1, ?2, ?3)",
            params![email, api_token_hash, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        Ok(User {
            id,
            email: email.to_string(),
            api_token_hash: api_token_hash.to_string(),
            created_at: now,
        })
    }

    /// Resolve a user by the hash of their API token
    pub fn get_user_by_token_hash(&self, token_hash: &str) -> DbResult<Option<User>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, email, api_token_hash, created_at FROM users WHERE api_token_hash = ?1",
        )?;
        let mut rows = stmt.query_map(params![token_hash], |row| {
            Ok(User {
                id: row.get(0)?,
                email: row.get(1)?,
                api_token_hash: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })?;
        rows.next().transpose().map_err(DbError::from)
    }
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}
