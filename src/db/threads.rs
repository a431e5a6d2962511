//! Thread and thread-message operations

use super::{
    parse_datetime, Database, DbError, DbResult, MessageMetadata, MessageRole, Thread,
    ThreadMessage,
};
use chrono::{Duration, Utc};
use rusqlite::{params, Row};
use std::collections::HashMap;

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadMessage> {
    Ok(ThreadMessage {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: MessageRole::parse(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        metadata: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

const MESSAGE_COLS: &str = "id, thread_id, role, content, metadata, created_at";

impl Database {
    /// Create a thread for a fiche
    pub fn create_thread(&self, fiche_id: i64, title: Option<&str>) -> DbResult<Thread> {
        let conn = self.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO threads (fiche_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![fiche_id, title, now.to_rfc3339()],
        )?;
        Ok(Thread {
            id: conn.last_insert_rowid(),
            fiche_id,
            title: title.map(String::from),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get thread by ID
    pub fn get_thread(&self, id: i64) -> DbResult<Thread> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, fiche_id, title, created_at, updated_at FROM threads WHERE id = ?1",
        )?;
        stmt.query_row(params![id], |row| {
            Ok(Thread {
                id: row.get(0)?,
                fiche_id: row.get(1)?,
                title: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
                updated_at: parse_datetime(&row.get::<_, String>(4)?),
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound("thread", id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Find the most recent thread for a fiche, creating one on first use
    pub fn get_or_create_thread(&self, fiche_id: i64) -> DbResult<Thread> {
        let existing: Option<i64> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT id FROM threads WHERE fiche_id = ?1 ORDER BY id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![fiche_id], |row| row.get(0))?;
            rows.next().transpose()?
        };
        match existing {
            Some(id) => self.get_thread(id),
            None => self.create_thread(fiche_id, None),
        }
    }

    /// Append a message to a thread
    pub fn append_message(
        &self,
        thread_id: i64,
        role: MessageRole,
        content: &str,
        metadata: Option<&MessageMetadata>,
    ) -> DbResult<ThreadMessage> {
        let conn = self.lock();
        let now = Utc::now();
        let metadata_str = metadata
            .filter(|m| !m.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO thread_messages (thread_id, role, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![thread_id, role.to_string(), content, metadata_str, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), thread_id],
        )?;
        Ok(ThreadMessage {
            id,
            thread_id,
            role,
            content: content.to_string(),
            metadata: metadata.filter(|m| !m.is_empty()).cloned(),
            created_at: now,
        })
    }

    /// Get all messages for a thread in insertion order
    pub fn get_messages(&self, thread_id: i64) -> DbResult<Vec<ThreadMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM thread_messages WHERE thread_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![thread_id], message_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get a single message by ID
    pub fn get_message(&self, id: i64) -> DbResult<ThreadMessage> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM thread_messages WHERE id = ?1"
        ))?;
        stmt.query_row(params![id], message_from_row).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound("message", id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// The tool message paired with a tool call, if one was already
    /// persisted. Drives continuation idempotency.
    pub fn find_tool_message(
        &self,
        thread_id: i64,
        tool_call_id: &str,
    ) -> DbResult<Option<ThreadMessage>> {
        let messages = self.get_messages(thread_id)?;
        Ok(messages
            .into_iter()
            .find(|m| m.role == MessageRole::Tool && m.tool_call_id() == Some(tool_call_id)))
    }

    /// Delete marker-tagged system messages older than `min_age_secs`.
    ///
    /// Messages younger than the cutoff are kept so a concurrent turn
    /// that just injected its context does not lose it.
    pub fn delete_marker_messages(
        &self,
        thread_id: i64,
        marker: &str,
        min_age_secs: i64,
    ) -> DbResult<usize> {
        let conn = self.lock();
        let cutoff = (Utc::now() - Duration::seconds(min_age_secs)).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM thread_messages
             WHERE thread_id = ?1 AND role = 'system'
               AND metadata LIKE '%' || ?2 || '%'
               AND created_at < ?3",
            params![thread_id, marker, cutoff],
        )?;
        Ok(deleted)
    }

    /// Latest assistant text per thread, one query for the whole batch
    pub fn latest_assistant_texts(
        &self,
        thread_ids: &[i64],
    ) -> DbResult<HashMap<i64, String>> {
        if thread_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock();
        let placeholders = vec!["?"; thread_ids.len()].join(", ");
        let sql = format!(
            "SELECT thread_id, content FROM (
                 SELECT thread_id, content,
                        ROW_NUMBER() OVER (PARTITION BY thread_id ORDER BY id DESC) AS rn
                 FROM thread_messages WHERE role = 'assistant' AND thread_id IN ({placeholders})
             ) WHERE rn = 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(thread_ids.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<Result<HashMap<_, _>, _>>().map_err(DbError::from)
    }
}
