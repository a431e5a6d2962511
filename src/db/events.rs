//! Course event log operations

use super::{parse_datetime, CourseEvent, Database, DbError, DbResult};
use chrono::Utc;
use rusqlite::{params, Row};
use std::collections::HashMap;

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CourseEvent> {
    Ok(CourseEvent {
        id: row.get(0)?,
        course_id: row.get(1)?,
        event_type: row.get(2)?,
        payload: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

const EVENT_COLS: &str = "id, course_id, event_type, payload, created_at";

impl Database {
    /// Append one event to a course's log
    pub fn append_course_event(
        &self,
        course_id: i64,
        event_type: &str,
        payload: Option<&serde_json::Value>,
    ) -> DbResult<CourseEvent> {
        let conn = self.lock();
        let now = Utc::now();
        let payload_str = payload.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO course_events (course_id, event_type, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![course_id, event_type, payload_str, now.to_rfc3339()],
        )?;
        Ok(CourseEvent {
            id: conn.last_insert_rowid(),
            course_id,
            event_type: event_type.to_string(),
            payload: payload.cloned(),
            created_at: now,
        })
    }

    /// Events for a course in insertion order, optionally filtered by type
    pub fn list_course_events(
        &self,
        course_id: i64,
        event_type: Option<&str>,
        limit: u32,
    ) -> DbResult<Vec<CourseEvent>> {
        let conn = self.lock();
        let filter = if event_type.is_some() {
            " AND event_type = ?3"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {EVENT_COLS} FROM course_events \
             WHERE course_id = ?1{filter} ORDER BY created_at ASC, id ASC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = if let Some(et) = event_type {
            stmt.query_map(params![course_id, limit, et], event_from_row)?
                .collect::<Result<Vec<_>, _>>()
        } else {
            stmt.query_map(params![course_id, limit], event_from_row)?
                .collect::<Result<Vec<_>, _>>()
        };
        rows.map_err(DbError::from)
    }

    /// Latest event per course, one window query for the whole batch
    pub fn latest_events_per_course(
        &self,
        course_ids: &[i64],
    ) -> DbResult<HashMap<i64, CourseEvent>> {
        if course_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock();
        let placeholders = vec!["?"; course_ids.len()].join(", ");
        let sql = format!(
            "SELECT {EVENT_COLS} FROM (
                 SELECT {EVENT_COLS},
                        ROW_NUMBER() OVER (PARTITION BY course_id \
                                           ORDER BY created_at DESC, id DESC) AS rn
                 FROM course_events WHERE course_id IN ({placeholders})
             ) WHERE rn = 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(course_ids.iter()), |row| {
            let event = event_from_row(row)?;
            Ok((event.course_id, event))
        })?;
        rows.collect::<Result<HashMap<_, _>, _>>().map_err(DbError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CourseStatus, CourseTrigger};
    use super::*;

    fn seed_course(db: &Database) -> i64 {
        let owner = db.create_user("o@example.com", "t").unwrap().id;
        let fiche = db.create_fiche(owner, "f", "", "", "m", &[]).unwrap();
        let thread = db.create_thread(fiche.id, None).unwrap();
        db.create_course(
            fiche.id,
            thread.id,
            CourseStatus::Running,
            CourseTrigger::Api,
            "corr",
            None,
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_append_and_list_ordered() {
        let db = Database::open_in_memory().unwrap();
        let course_id = seed_course(&db);

        db.append_course_event(course_id, "concierge_started", None)
            .unwrap();
        db.append_course_event(
            course_id,
            "commis_spawned",
            Some(&serde_json::json!({"job_id": 1})),
        )
        .unwrap();

        let events = db.list_course_events(course_id, None, 100).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "concierge_started");
        assert_eq!(
            events[1].payload.as_ref().and_then(|p| p.get("job_id")),
            Some(&serde_json::json!(1))
        );
    }

    #[test]
    fn test_type_filter() {
        let db = Database::open_in_memory().unwrap();
        let course_id = seed_course(&db);

        db.append_course_event(course_id, "tool_started", None).unwrap();
        db.append_course_event(course_id, "tool_completed", None).unwrap();

        let events = db
            .list_course_events(course_id, Some("tool_completed"), 100)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "tool_completed");
    }

    #[test]
    fn test_latest_events_per_course() {
        let db = Database::open_in_memory().unwrap();
        let c1 = seed_course(&db);

        db.append_course_event(c1, "concierge_started", None).unwrap();
        db.append_course_event(c1, "concierge_complete", None).unwrap();

        let latest = db.latest_events_per_course(&[c1]).unwrap();
        assert_eq!(
            latest.get(&c1).map(|e| e.event_type.as_str()),
            Some("concierge_complete")
        );
    }
}
