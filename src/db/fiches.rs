//! Fiche operations

use super::{parse_datetime, parse_opt_datetime, Database, DbError, DbResult, Fiche, FicheStatus};
use chrono::Utc;
use rusqlite::{params, Row};

fn fiche_from_row(row: &Row<'_>) -> rusqlite::Result<Fiche> {
    Ok(Fiche {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        system_instructions: row.get(3)?,
        task_instructions: row.get(4)?,
        model: row.get(5)?,
        allowed_tools: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        status: FicheStatus::parse(&row.get::<_, String>(7)?),
        last_error: row.get(8)?,
        last_run_at: parse_opt_datetime(row.get(9)?),
        next_run_at: parse_opt_datetime(row.get(10)?),
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        updated_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

const FICHE_COLS: &str = "id, owner_id, name, system_instructions, task_instructions, model, \
     allowed_tools, status, last_error, last_run_at, next_run_at, created_at, updated_at";

impl Database {
    /// Create a fiche for a user
    pub fn create_fiche(
        &self,
        owner_id: i64,
        name: &str,
        system_instructions: &str,
        task_instructions: &str,
        model: &str,
        allowed_tools: &[String],
    ) -> DbResult<Fiche> {
        let conn = self.lock();
        let now = Utc::now();
        let tools_json = serde_json::to_string(allowed_tools)?;
        conn.execute(
            "INSERT INTO fiches (owner_id, name, system_instructions, task_instructions, model, \
             allowed_tools, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'idle', ?7, ?7)",
            params![
                owner_id,
                name,
                system_instructions,
                task_instructions,
                model,
                tools_json,
                now.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_fiche(id)
    }

    /// Get fiche by ID
    pub fn get_fiche(&self, id: i64) -> DbResult<Fiche> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {FICHE_COLS} FROM fiches WHERE id = ?1"))?;
        stmt.query_row(params![id], fiche_from_row).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound("fiche", id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Get fiche by ID, owner-scoped. Non-owners see "not found".
    pub fn get_fiche_owned(&self, id: i64, owner_id: i64) -> DbResult<Fiche> {
        let fiche = self.get_fiche(id)?;
        if fiche.owner_id != owner_id {
            return Err(DbError::NotFound("fiche", id.to_string()));
        }
        Ok(fiche)
    }

    /// Find the named fiche for a user, creating it on first use
    pub fn get_or_create_fiche(
        &self,
        owner_id: i64,
        name: &str,
        system_instructions: &str,
        model: &str,
        allowed_tools: &[String],
    ) -> DbResult<Fiche> {
        let existing = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {FICHE_COLS} FROM fiches WHERE owner_id = ?1 AND name = ?2"
            ))?;
            let mut rows = stmt.query_map(params![owner_id, name], fiche_from_row)?;
            rows.next().transpose()?
        };
        match existing {
            Some(fiche) => Ok(fiche),
            None => self.create_fiche(owner_id, name, system_instructions, "", model, allowed_tools),
        }
    }

    /// List fiches for a user
    pub fn list_fiches(&self, owner_id: i64) -> DbResult<Vec<Fiche>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FICHE_COLS} FROM fiches WHERE owner_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![owner_id], fiche_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Set fiche status, replacing any previous error note
    pub fn set_fiche_status(
        &self,
        id: i64,
        status: FicheStatus,
        last_error: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE fiches SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.to_string(), last_error, now, id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("fiche", id.to_string()));
        }
        Ok(())
    }

    /// Record a completed run on the fiche
    pub fn mark_fiche_run_finished(
        &self,
        id: i64,
        status: FicheStatus,
        last_error: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE fiches SET status = ?1, last_error = ?2, last_run_at = ?3, updated_at = ?3 \
             WHERE id = ?4",
            params![status.to_string(), last_error, now, id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("fiche", id.to_string()));
        }
        Ok(())
    }

    /// IDs of fiches currently marked running
    pub fn fiches_marked_running(&self) -> DbResult<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM fiches WHERE status = 'running'")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_user(db: &Database) -> i64 {
        db.create_user("owner@example.com", "tok").unwrap().id
    }

    #[test]
    fn test_create_and_get_fiche() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);

        let fiche = db
            .create_fiche(owner, "concierge", "be helpful", "", "gpt-test", &[])
            .unwrap();
        assert_eq!(fiche.status, FicheStatus::Idle);
        assert_eq!(fiche.owner_id, owner);

        let fetched = db.get_fiche(fiche.id).unwrap();
        assert_eq!(fetched.name, "concierge");
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);

        let a = db
            .get_or_create_fiche(owner, "concierge", "sys", "gpt-test", &[])
            .unwrap();
        let b = db
            .get_or_create_fiche(owner, "concierge", "sys", "gpt-test", &[])
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_owner_scoping_hides_existence() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let other = db.create_user("other@example.com", "tok2").unwrap().id;

        let fiche = db
            .create_fiche(owner, "concierge", "", "", "gpt-test", &[])
            .unwrap();
        assert!(db.get_fiche_owned(fiche.id, other).is_err());
        assert!(db.get_fiche_owned(fiche.id, owner).is_ok());
    }

    #[test]
    fn test_fiches_marked_running() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let fiche = db
            .create_fiche(owner, "concierge", "", "", "gpt-test", &[])
            .unwrap();

        assert!(db.fiches_marked_running().unwrap().is_empty());
        db.set_fiche_status(fiche.id, FicheStatus::Running, None)
            .unwrap();
        assert_eq!(db.fiches_marked_running().unwrap(), vec![fiche.id]);
    }
}
