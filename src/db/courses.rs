//! Course operations
//!
//! Every transition out of a non-terminal status is a guarded
//! single-statement update; the changed-row count is the witness that
//! this caller (and no concurrent one) performed the transition.

use super::{
    parse_datetime, parse_opt_datetime, Course, CourseStatus, CourseTrigger, Database, DbError,
    DbResult,
};
use chrono::Utc;
use rusqlite::{params, Row};

fn course_from_row(row: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        fiche_id: row.get(1)?,
        thread_id: row.get(2)?,
        status: CourseStatus::parse(&row.get::<_, String>(3)?),
        trigger: CourseTrigger::parse(&row.get::<_, String>(4)?),
        correlation_id: row.get(5)?,
        continuation_of_course_id: row.get(6)?,
        assistant_message_id: row.get(7)?,
        summary: row.get(8)?,
        error: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        updated_at: parse_datetime(&row.get::<_, String>(11)?),
        finished_at: parse_opt_datetime(row.get(12)?),
    })
}

const COURSE_COLS: &str = "id, fiche_id, thread_id, status, trigger_kind, correlation_id, \
     continuation_of_course_id, assistant_message_id, summary, error, created_at, updated_at, \
     finished_at";

fn status_list(statuses: &[CourseStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Database {
    /// Create a course in the given initial status
    pub fn create_course(
        &self,
        fiche_id: i64,
        thread_id: i64,
        status: CourseStatus,
        trigger: CourseTrigger,
        correlation_id: &str,
        continuation_of_course_id: Option<i64>,
    ) -> DbResult<Course> {
        let conn = self.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO courses (fiche_id, thread_id, status, trigger_kind, correlation_id, \
             continuation_of_course_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                fiche_id,
                thread_id,
                status.to_string(),
                trigger.to_string(),
                correlation_id,
                continuation_of_course_id,
                now.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_course(id)
    }

    /// Get course by ID
    pub fn get_course(&self, id: i64) -> DbResult<Course> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {COURSE_COLS} FROM courses WHERE id = ?1"))?;
        stmt.query_row(params![id], course_from_row).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound("course", id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Get course by ID, owner-scoped through the owning fiche
    pub fn get_course_owned(&self, id: i64, owner_id: i64) -> DbResult<Course> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {cols} FROM courses c JOIN fiches f ON f.id = c.fiche_id \
             WHERE c.id = ?1 AND f.owner_id = ?2",
            cols = COURSE_COLS
                .split(", ")
                .map(|c| format!("c.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.query_row(params![id, owner_id], course_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound("course", id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// Recent courses for an owner, newest first, with fiche names
    pub fn list_recent_courses(
        &self,
        owner_id: i64,
        limit: u32,
        fiche_id: Option<i64>,
    ) -> DbResult<Vec<(Course, String)>> {
        let conn = self.lock();
        let filter = if fiche_id.is_some() {
            " AND c.fiche_id = ?3"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {cols}, f.name FROM courses c JOIN fiches f ON f.id = c.fiche_id \
             WHERE f.owner_id = ?1{filter} ORDER BY c.created_at DESC, c.id DESC LIMIT ?2",
            cols = COURSE_COLS
                .split(", ")
                .map(|c| format!("c.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let map = |row: &Row<'_>| {
            let course = course_from_row(row)?;
            let name: String = row.get(13)?;
            Ok((course, name))
        };
        let rows = if let Some(fid) = fiche_id {
            stmt.query_map(params![owner_id, limit, fid], map)?
                .collect::<Result<Vec<_>, _>>()
        } else {
            stmt.query_map(params![owner_id, limit], map)?
                .collect::<Result<Vec<_>, _>>()
        };
        rows.map_err(DbError::from)
    }

    /// Most recent non-terminal course for an owner.
    ///
    /// A DEFERRED course no longer counts as active once a successful
    /// continuation course exists for the same correlation id.
    pub fn active_course(&self, owner_id: i64) -> DbResult<Option<Course>> {
        let candidates = {
            let conn = self.lock();
            let sql = format!(
                "SELECT {cols} FROM courses c JOIN fiches f ON f.id = c.fiche_id \
                 WHERE f.owner_id = ?1 AND c.status IN ('queued', 'running', 'waiting', 'deferred') \
                 ORDER BY c.created_at DESC, c.id DESC",
                cols = COURSE_COLS
                    .split(", ")
                    .map(|c| format!("c.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![owner_id], course_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for course in candidates {
            if course.status == CourseStatus::Deferred
                && self.has_successful_continuation(&course.correlation_id, course.id)?
            {
                continue;
            }
            return Ok(Some(course));
        }
        Ok(None)
    }

    fn has_successful_continuation(
        &self,
        correlation_id: &str,
        course_id: i64,
    ) -> DbResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM courses \
             WHERE correlation_id = ?1 AND id != ?2 AND status = 'success'",
            params![correlation_id, course_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Guarded status transition. Returns false when the row was not in
    /// any of the expected `from` statuses (someone else got there first).
    pub fn transition_course(
        &self,
        id: i64,
        from: &[CourseStatus],
        to: CourseStatus,
    ) -> DbResult<bool> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let finished = if to.is_terminal() { Some(now.clone()) } else { None };
        let sql = format!(
            "UPDATE courses SET status = ?1, updated_at = ?2, \
             finished_at = COALESCE(?3, finished_at) \
             WHERE id = ?4 AND status IN ({})",
            status_list(from)
        );
        let updated = conn.execute(&sql, params![to.to_string(), now, finished, id])?;
        Ok(updated == 1)
    }

    /// RUNNING -> WAITING, recording the paused assistant message
    pub fn set_course_waiting(&self, id: i64, assistant_message_id: i64) -> DbResult<bool> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE courses SET status = 'waiting', assistant_message_id = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'running'",
            params![assistant_message_id, now, id],
        )?;
        Ok(updated == 1)
    }

    /// Settle a course into a terminal status with its summary/error
    pub fn settle_course(
        &self,
        id: i64,
        status: CourseStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> DbResult<bool> {
        debug_assert!(status.is_terminal());
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE courses SET status = ?1, summary = COALESCE(?2, summary), error = ?3, \
             updated_at = ?4, finished_at = ?4 \
             WHERE id = ?5 AND status IN ('queued', 'running', 'waiting', 'deferred')",
            params![status.to_string(), summary, error, now, id],
        )?;
        Ok(updated == 1)
    }

    /// Operator cancellation from any non-terminal status
    pub fn cancel_course(&self, id: i64) -> DbResult<bool> {
        self.transition_course(
            id,
            &[
                CourseStatus::Queued,
                CourseStatus::Running,
                CourseStatus::Waiting,
                CourseStatus::Deferred,
            ],
            CourseStatus::Cancelled,
        )
    }

    /// All courses currently in any of the given statuses
    pub fn courses_with_status(&self, statuses: &[CourseStatus]) -> DbResult<Vec<Course>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COURSE_COLS} FROM courses WHERE status IN ({}) ORDER BY id ASC",
            status_list(statuses)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], course_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Whether any non-terminal course exists for the fiche
    pub fn fiche_has_open_course(&self, fiche_id: i64) -> DbResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM courses WHERE fiche_id = ?1 \
             AND status IN ('queued', 'running', 'waiting', 'deferred')",
            params![fiche_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(db: &Database) -> (i64, i64, i64) {
        let owner = db.create_user("o@example.com", "t").unwrap().id;
        let fiche = db.create_fiche(owner, "f", "", "", "m", &[]).unwrap();
        let thread = db.create_thread(fiche.id, None).unwrap();
        (owner, fiche.id, thread.id)
    }

    fn new_course(db: &Database, fiche_id: i64, thread_id: i64, status: CourseStatus) -> Course {
        db.create_course(
            fiche_id,
            thread_id,
            status,
            CourseTrigger::Api,
            &uuid::Uuid::new_v4().to_string(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_guarded_transition_single_winner() {
        let db = Database::open_in_memory().unwrap();
        let (_, fiche_id, thread_id) = seed(&db);
        let course = new_course(&db, fiche_id, thread_id, CourseStatus::Waiting);

        let first = db
            .transition_course(course.id, &[CourseStatus::Waiting], CourseStatus::Running)
            .unwrap();
        let second = db
            .transition_course(course.id, &[CourseStatus::Waiting], CourseStatus::Running)
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_settle_sets_finished_at() {
        let db = Database::open_in_memory().unwrap();
        let (_, fiche_id, thread_id) = seed(&db);
        let course = new_course(&db, fiche_id, thread_id, CourseStatus::Running);

        assert!(db
            .settle_course(course.id, CourseStatus::Success, Some("done"), None)
            .unwrap());
        let settled = db.get_course(course.id).unwrap();
        assert_eq!(settled.status, CourseStatus::Success);
        assert!(settled.finished_at.is_some());
        assert_eq!(settled.summary.as_deref(), Some("done"));

        // A second settle is a no-op
        assert!(!db
            .settle_course(course.id, CourseStatus::Failed, None, Some("late"))
            .unwrap());
    }

    #[test]
    fn test_set_waiting_records_assistant_message() {
        let db = Database::open_in_memory().unwrap();
        let (_, fiche_id, thread_id) = seed(&db);
        let course = new_course(&db, fiche_id, thread_id, CourseStatus::Running);

        assert!(db.set_course_waiting(course.id, 42).unwrap());
        let waiting = db.get_course(course.id).unwrap();
        assert_eq!(waiting.status, CourseStatus::Waiting);
        assert_eq!(waiting.assistant_message_id, Some(42));
    }

    #[test]
    fn test_cancel_only_non_terminal() {
        let db = Database::open_in_memory().unwrap();
        let (_, fiche_id, thread_id) = seed(&db);
        let course = new_course(&db, fiche_id, thread_id, CourseStatus::Running);

        assert!(db.cancel_course(course.id).unwrap());
        assert!(!db.cancel_course(course.id).unwrap());
    }

    #[test]
    fn test_active_course_skips_settled_deferred() {
        let db = Database::open_in_memory().unwrap();
        let (owner, fiche_id, thread_id) = seed(&db);

        let deferred = db
            .create_course(
                fiche_id,
                thread_id,
                CourseStatus::Deferred,
                CourseTrigger::Api,
                "corr-1",
                None,
            )
            .unwrap();

        // Still active while no continuation has settled it
        let active = db.active_course(owner).unwrap();
        assert_eq!(active.map(|c| c.id), Some(deferred.id));

        // A successful continuation with the same correlation id clears it
        let cont = db
            .create_course(
                fiche_id,
                thread_id,
                CourseStatus::Running,
                CourseTrigger::Continuation,
                "corr-1",
                Some(deferred.id),
            )
            .unwrap();
        db.settle_course(cont.id, CourseStatus::Success, None, None)
            .unwrap();
        assert!(db.active_course(owner).unwrap().is_none());
    }

    #[test]
    fn test_owner_scoping() {
        let db = Database::open_in_memory().unwrap();
        let (owner, fiche_id, thread_id) = seed(&db);
        let stranger = db.create_user("s@example.com", "t2").unwrap().id;
        let course = new_course(&db, fiche_id, thread_id, CourseStatus::Running);

        assert!(db.get_course_owned(course.id, owner).is_ok());
        assert!(db.get_course_owned(course.id, stranger).is_err());
    }
}
