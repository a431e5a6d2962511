//! Commis job and runner job operations

use super::{
    parse_datetime, parse_opt_datetime, CommisConfig, CommisJob, CommisJobStatus, Database,
    DbError, DbResult, RunnerJob, RunnerJobStatus,
};
use chrono::Utc;
use rusqlite::{params, Row};

fn commis_job_from_row(row: &Row<'_>) -> rusqlite::Result<CommisJob> {
    Ok(CommisJob {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        task: row.get(2)?,
        model: row.get(3)?,
        status: CommisJobStatus::parse(&row.get::<_, String>(4)?),
        concierge_course_id: row.get(5)?,
        tool_call_id: row.get(6)?,
        commis_id: row.get(7)?,
        config: serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
        error: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        started_at: parse_opt_datetime(row.get(11)?),
        finished_at: parse_opt_datetime(row.get(12)?),
    })
}

const JOB_COLS: &str = "id, owner_id, task, model, status, concierge_course_id, tool_call_id, \
     commis_id, config, error, created_at, started_at, finished_at";

impl Database {
    /// Create a queued commis job
    pub fn create_commis_job(
        &self,
        owner_id: i64,
        task: &str,
        model: &str,
        concierge_course_id: Option<i64>,
        tool_call_id: Option<&str>,
        config: &CommisConfig,
    ) -> DbResult<CommisJob> {
        let conn = self.lock();
        let now = Utc::now();
        let config_json = serde_json::to_string(config)?;
        conn.execute(
            "INSERT INTO commis_jobs (owner_id, task, model, status, concierge_course_id, \
             tool_call_id, config, created_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6, ?7)",
            params![
                owner_id,
                task,
                model,
                concierge_course_id,
                tool_call_id,
                config_json,
                now.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_commis_job(id)
    }

    /// Get commis job by ID
    pub fn get_commis_job(&self, id: i64) -> DbResult<CommisJob> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLS} FROM commis_jobs WHERE id = ?1"))?;
        stmt.query_row(params![id], commis_job_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::NotFound("commis job", id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// Atomically claim up to `max` queued jobs, oldest first.
    ///
    /// This single statement is the only path from queued to running;
    /// concurrent claimers can never receive the same job twice.
    pub fn claim_queued_jobs(&self, max: u32) -> DbResult<Vec<i64>> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "UPDATE commis_jobs SET status = 'running', started_at = ?1
             WHERE id IN (SELECT id FROM commis_jobs WHERE status = 'queued'
                          ORDER BY created_at ASC, id ASC LIMIT ?2)
             RETURNING id",
        )?;
        let rows = stmt.query_map(params![now, max], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Record the artifact directory key once the commis is created
    pub fn set_job_commis_id(&self, id: i64, commis_id: &str) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE commis_jobs SET commis_id = ?1 WHERE id = ?2",
            params![commis_id, id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("commis job", id.to_string()));
        }
        Ok(())
    }

    /// running -> terminal. Returns false when the job was not running.
    pub fn finish_commis_job(
        &self,
        id: i64,
        status: CommisJobStatus,
        error: Option<&str>,
    ) -> DbResult<bool> {
        debug_assert!(status.is_terminal());
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE commis_jobs SET status = ?1, error = ?2, finished_at = ?3 \
             WHERE id = ?4 AND status = 'running'",
            params![status.to_string(), error, now, id],
        )?;
        Ok(updated == 1)
    }

    /// The single non-terminal job spawned by a waiting course, if any
    pub fn nonterminal_job_for_course(&self, course_id: i64) -> DbResult<Option<CommisJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLS} FROM commis_jobs \
             WHERE concierge_course_id = ?1 AND status IN ('queued', 'running') \
             ORDER BY id DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![course_id], commis_job_from_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    /// All commis jobs in the given status
    pub fn commis_jobs_with_status(&self, status: CommisJobStatus) -> DbResult<Vec<CommisJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLS} FROM commis_jobs WHERE status = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![status.to_string()], commis_job_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Most recent commis jobs for an owner, newest first
    pub fn recent_commis_jobs(&self, owner_id: i64, limit: u32) -> DbResult<Vec<CommisJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLS} FROM commis_jobs WHERE owner_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![owner_id, limit], commis_job_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Runner Jobs ====================

    /// Create a queued runner job
    pub fn create_runner_job(
        &self,
        owner_id: i64,
        runner_id: Option<i64>,
        command: &str,
    ) -> DbResult<RunnerJob> {
        let conn = self.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO runner_jobs (runner_id, owner_id, command, status, created_at) \
             VALUES (?1, ?2, ?3, 'queued', ?4)",
            params![runner_id, owner_id, command, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        Ok(RunnerJob {
            id,
            runner_id,
            owner_id,
            command: command.to_string(),
            status: RunnerJobStatus::Queued,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    /// Fail every runner job currently queued or running; returns the ids
    pub fn fail_open_runner_jobs(&self, error: &str) -> DbResult<Vec<i64>> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "UPDATE runner_jobs SET status = 'failed', error = ?1, finished_at = ?2 \
             WHERE status IN ('queued', 'running') RETURNING id",
        )?;
        let rows = stmt.query_map(params![error, now], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_owner(db: &Database) -> i64 {
        db.create_user("o@example.com", "t").unwrap().id
    }

    fn queue_job(db: &Database, owner: i64) -> CommisJob {
        db.create_commis_job(owner, "do a thing", "gpt-test", None, None, &CommisConfig::default())
            .unwrap()
    }

    #[test]
    fn test_claim_moves_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_owner(&db);
        let a = queue_job(&db, owner);
        let b = queue_job(&db, owner);
        let c = queue_job(&db, owner);

        let claimed = db.claim_queued_jobs(2).unwrap();
        assert_eq!(claimed, vec![a.id, b.id]);

        let rest = db.claim_queued_jobs(2).unwrap();
        assert_eq!(rest, vec![c.id]);

        assert!(db.claim_queued_jobs(2).unwrap().is_empty());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_owner(&db);
        for _ in 0..5 {
            queue_job(&db, owner);
        }

        let mut seen = std::collections::HashSet::new();
        // Repeated claims never hand out the same id twice
        loop {
            let batch = db.claim_queued_jobs(2).unwrap();
            if batch.is_empty() {
                break;
            }
            for id in batch {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_finish_requires_running() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_owner(&db);
        let job = queue_job(&db, owner);

        // Not yet claimed
        assert!(!db
            .finish_commis_job(job.id, CommisJobStatus::Success, None)
            .unwrap());

        db.claim_queued_jobs(1).unwrap();
        assert!(db
            .finish_commis_job(job.id, CommisJobStatus::Success, None)
            .unwrap());
        // Already settled
        assert!(!db
            .finish_commis_job(job.id, CommisJobStatus::Failed, Some("late"))
            .unwrap());

        let settled = db.get_commis_job(job.id).unwrap();
        assert_eq!(settled.status, CommisJobStatus::Success);
        assert!(settled.finished_at.is_some());
    }

    #[test]
    fn test_nonterminal_job_for_course() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_owner(&db);
        let fiche = db.create_fiche(owner, "f", "", "", "m", &[]).unwrap();
        let thread = db.create_thread(fiche.id, None).unwrap();
        let course = db
            .create_course(
                fiche.id,
                thread.id,
                super::super::CourseStatus::Waiting,
                super::super::CourseTrigger::Api,
                "corr",
                None,
            )
            .unwrap();

        let job = db
            .create_commis_job(
                owner,
                "task",
                "gpt-test",
                Some(course.id),
                Some("call-1"),
                &CommisConfig::default(),
            )
            .unwrap();

        let found = db.nonterminal_job_for_course(course.id).unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.tool_call_id.as_deref(), Some("call-1"));

        db.claim_queued_jobs(1).unwrap();
        db.finish_commis_job(job.id, CommisJobStatus::Failed, Some("boom"))
            .unwrap();
        assert!(db.nonterminal_job_for_course(course.id).unwrap().is_none());
    }

    #[test]
    fn test_fail_open_runner_jobs() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_owner(&db);
        db.create_runner_job(owner, None, "echo hi").unwrap();
        db.create_runner_job(owner, None, "echo bye").unwrap();

        let failed = db.fail_open_runner_jobs("Orphaned after server restart").unwrap();
        assert_eq!(failed.len(), 2);

        // Idempotent
        assert!(db.fail_open_runner_jobs("again").unwrap().is_empty());
    }
}
