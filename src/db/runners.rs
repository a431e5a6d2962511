//! Runner fleet and enrollment token operations

use super::{
    parse_datetime, parse_opt_datetime, Database, DbError, DbResult, Runner, RunnerStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

fn runner_from_row(row: &Row<'_>) -> rusqlite::Result<Runner> {
    Ok(Runner {
        id: row.get(0)?,
        name: row.get(1)?,
        status: RunnerStatus::parse(&row.get::<_, String>(2)?),
        labels: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
        metadata: serde_json::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(serde_json::Value::Null),
        secret_hash: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        last_seen_at: parse_opt_datetime(row.get(7)?),
    })
}

const RUNNER_COLS: &str =
    "id, name, status, labels, metadata, secret_hash, created_at, last_seen_at";

impl Database {
    /// Store a hashed single-use enrollment token
    pub fn create_enroll_token(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> DbResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO enroll_tokens (token_hash, expires_at, created_at) VALUES (?1, ?2, ?3)",
            params![token_hash, expires_at.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Consume an enrollment token. Exactly one concurrent caller wins:
    /// `used_at` is set in the same statement that checks it is unset.
    pub fn consume_enroll_token(&self, token_hash: &str) -> DbResult<bool> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE enroll_tokens SET used_at = ?1 \
             WHERE token_hash = ?2 AND used_at IS NULL AND expires_at > ?1",
            params![now, token_hash],
        )?;
        Ok(updated == 1)
    }

    /// Register a runner. Duplicate names are a conflict.
    pub fn create_runner(
        &self,
        name: &str,
        labels: &[String],
        metadata: &serde_json::Value,
        secret_hash: &str,
    ) -> DbResult<Runner> {
        let conn = self.lock();
        let now = Utc::now();
        let result = conn.execute(
            "INSERT INTO runners (name, status, labels, metadata, secret_hash, created_at) \
             VALUES (?1, 'offline', ?2, ?3, ?4, ?5)",
            params![
                name,
                serde_json::to_string(labels)?,
                serde_json::to_string(metadata)?,
                secret_hash,
                now.to_rfc3339()
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(DbError::Conflict(format!(
                    "runner name already taken: {name}"
                )));
            }
            Err(e) => return Err(DbError::Sqlite(e)),
        }
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_runner(id)
    }

    /// Get runner by ID
    pub fn get_runner(&self, id: i64) -> DbResult<Runner> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {RUNNER_COLS} FROM runners WHERE id = ?1"))?;
        stmt.query_row(params![id], runner_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::NotFound("runner", id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// List all runners
    pub fn list_runners(&self) -> DbResult<Vec<Runner>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUNNER_COLS} FROM runners ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], runner_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Replace the runner's secret hash and push it back offline.
    /// Revoked runners cannot rotate.
    pub fn rotate_runner_secret(&self, id: i64, new_secret_hash: &str) -> DbResult<bool> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE runners SET secret_hash = ?1, status = 'offline' \
             WHERE id = ?2 AND status != 'revoked'",
            params![new_secret_hash, id],
        )?;
        Ok(updated == 1)
    }

    /// Set a runner's status
    pub fn set_runner_status(&self, id: i64, status: RunnerStatus) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE runners SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("runner", id.to_string()));
        }
        Ok(())
    }
}
