//! Deployment and instance operations

use super::{
    parse_datetime, parse_opt_datetime, Database, DbError, DbResult, DeployState, Deployment,
    DeploymentStatus, Instance, InstanceStatus,
};
use chrono::Utc;
use rusqlite::{params, Row};

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    Ok(Deployment {
        id: row.get(0)?,
        image: row.get(1)?,
        status: DeploymentStatus::parse(&row.get::<_, String>(2)?),
        max_parallel: row.get(3)?,
        failure_threshold: row.get(4)?,
        failure_count: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        finished_at: parse_opt_datetime(row.get(7)?),
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: row.get(0)?,
        subdomain: row.get(1)?,
        container_name: row.get(2)?,
        status: InstanceStatus::parse(&row.get::<_, String>(3)?),
        deploy_ring: row.get(4)?,
        deploy_state: DeployState::parse(&row.get::<_, String>(5)?),
        current_image: row.get(6)?,
        last_healthy_image: row.get(7)?,
        deploy_id: row.get(8)?,
        deploy_error: row.get(9)?,
        last_health_at: parse_opt_datetime(row.get(10)?),
        created_at: parse_datetime(&row.get::<_, String>(11)?),
    })
}

const DEPLOYMENT_COLS: &str =
    "id, image, status, max_parallel, failure_threshold, failure_count, created_at, finished_at";
const INSTANCE_COLS: &str = "id, subdomain, container_name, status, deploy_ring, deploy_state, \
     current_image, last_healthy_image, deploy_id, deploy_error, last_health_at, created_at";

/// Instance counts per deploy_state for one deployment
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeployStateCounts {
    pub pending: i64,
    pub deploying: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub rolled_back: i64,
    pub skipped: i64,
}

impl Database {
    /// Insert a new deployment unless a blocking one already exists.
    ///
    /// The existence check and the insert are one statement, so two
    /// concurrent creators cannot both pass the guard.
    pub fn create_deployment(
        &self,
        id: &str,
        image: &str,
        max_parallel: u32,
        failure_threshold: u32,
    ) -> DbResult<Deployment> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT INTO deployments (id, image, status, max_parallel, failure_threshold, \
             failure_count, created_at)
             SELECT ?1, ?2, 'pending', ?3, ?4, 0, ?5
             WHERE NOT EXISTS (SELECT 1 FROM deployments \
                               WHERE status IN ('pending', 'in_progress', 'paused'))",
            params![id, image, max_parallel, failure_threshold, now],
        )?;
        if inserted == 0 {
            return Err(DbError::Conflict(
                "another deployment is already in progress".to_string(),
            ));
        }
        drop(conn);
        self.get_deployment(id)
    }

    /// Get deployment by ID
    pub fn get_deployment(&self, id: &str) -> DbResult<Deployment> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {DEPLOYMENT_COLS} FROM deployments WHERE id = ?1"))?;
        stmt.query_row(params![id], deployment_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::NotFound("deployment", id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// List deployments, newest first
    pub fn list_deployments(&self) -> DbResult<Vec<Deployment>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPLOYMENT_COLS} FROM deployments ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], deployment_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// The deployment currently blocking new rollouts, if any
    pub fn blocking_deployment(&self) -> DbResult<Option<Deployment>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPLOYMENT_COLS} FROM deployments \
             WHERE status IN ('pending', 'in_progress', 'paused') LIMIT 1"
        ))?;
        let mut rows = stmt.query_map([], deployment_from_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    /// Set deployment status; stamps finished_at for completed/failed
    pub fn set_deployment_status(&self, id: &str, status: DeploymentStatus) -> DbResult<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let finished = matches!(
            status,
            DeploymentStatus::Completed | DeploymentStatus::Failed
        )
        .then(|| now.clone());
        let updated = conn.execute(
            "UPDATE deployments SET status = ?1, finished_at = COALESCE(?2, finished_at) \
             WHERE id = ?3",
            params![status.to_string(), finished, id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("deployment", id.to_string()));
        }
        Ok(())
    }

    /// Bump the failure count, returning the new value
    pub fn increment_deployment_failures(&self, id: &str) -> DbResult<u32> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "UPDATE deployments SET failure_count = failure_count + 1 \
             WHERE id = ?1 RETURNING failure_count",
        )?;
        stmt.query_row(params![id], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::NotFound("deployment", id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    // ==================== Instances ====================

    /// Register an instance
    pub fn create_instance(
        &self,
        subdomain: &str,
        container_name: &str,
        deploy_ring: i64,
    ) -> DbResult<Instance> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO instances (subdomain, container_name, status, deploy_ring, \
             deploy_state, created_at)
             VALUES (?1, ?2, 'active', ?3, 'idle', ?4)",
            params![subdomain, container_name, deploy_ring, now],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_instance(id)
    }

    /// Get instance by ID
    pub fn get_instance(&self, id: i64) -> DbResult<Instance> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {INSTANCE_COLS} FROM instances WHERE id = ?1"))?;
        stmt.query_row(params![id], instance_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::NotFound("instance", id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// All active instances ordered by ring then id
    pub fn active_instances(&self) -> DbResult<Vec<Instance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLS} FROM instances WHERE status = 'active' \
             ORDER BY deploy_ring ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], instance_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Instances linked to a deployment
    pub fn instances_for_deployment(&self, deploy_id: &str) -> DbResult<Vec<Instance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLS} FROM instances WHERE deploy_id = ?1 \
             ORDER BY deploy_ring ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![deploy_id], instance_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Link an instance to a deployment with deploy_state = pending
    pub fn link_instance_to_deployment(&self, instance_id: i64, deploy_id: &str) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE instances SET deploy_id = ?1, deploy_state = 'pending', deploy_error = NULL \
             WHERE id = ?2",
            params![deploy_id, instance_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("instance", instance_id.to_string()));
        }
        Ok(())
    }

    /// pending -> deploying for one instance. False when already taken.
    pub fn begin_instance_deploy(&self, instance_id: i64) -> DbResult<bool> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE instances SET deploy_state = 'deploying' \
             WHERE id = ?1 AND deploy_state = 'pending'",
            params![instance_id],
        )?;
        Ok(updated == 1)
    }

    /// Record a healthy deploy of `image` on the instance
    pub fn mark_instance_deployed(&self, instance_id: i64, image: &str) -> DbResult<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE instances SET deploy_state = 'succeeded', current_image = ?1, \
             last_healthy_image = ?1, deploy_error = NULL, last_health_at = ?2 WHERE id = ?3",
            params![image, now, instance_id],
        )?;
        Ok(())
    }

    /// Record a successful rollback to the previous healthy image
    pub fn mark_instance_rolled_back(&self, instance_id: i64, error: &str) -> DbResult<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE instances SET deploy_state = 'rolled_back', \
             current_image = last_healthy_image, deploy_error = ?1, last_health_at = ?2 \
             WHERE id = ?3",
            params![error, now, instance_id],
        )?;
        Ok(())
    }

    /// Record a deploy failure; `mark_down` also fails the instance itself
    pub fn mark_instance_deploy_failed(
        &self,
        instance_id: i64,
        error: &str,
        mark_down: bool,
    ) -> DbResult<()> {
        let conn = self.lock();
        let status_sql = if mark_down { ", status = 'failed'" } else { "" };
        conn.execute(
            &format!(
                "UPDATE instances SET deploy_state = 'failed', deploy_error = ?1{status_sql} \
                 WHERE id = ?2"
            ),
            params![error, instance_id],
        )?;
        Ok(())
    }

    /// Mark every still-pending instance of a deployment as skipped,
    /// keeping the deploy_id link. Returns the skipped ids.
    pub fn skip_pending_instances(&self, deploy_id: &str) -> DbResult<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "UPDATE instances SET deploy_state = 'skipped' \
             WHERE deploy_id = ?1 AND deploy_state = 'pending' RETURNING id",
        )?;
        let rows = stmt.query_map(params![deploy_id], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Instances caught mid-deploy (for restart recovery)
    pub fn instances_in_deploy_state(&self, state: DeployState) -> DbResult<Vec<Instance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLS} FROM instances WHERE deploy_state = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![state.to_string()], instance_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Set an instance's status (deprovisioning etc.)
    pub fn set_instance_status(&self, instance_id: i64, status: InstanceStatus) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE instances SET status = ?1 WHERE id = ?2",
            params![status.to_string(), instance_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("instance", instance_id.to_string()));
        }
        Ok(())
    }

    /// Per-state instance counts for a deployment
    pub fn deploy_state_counts(&self, deploy_id: &str) -> DbResult<DeployStateCounts> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT deploy_state, COUNT(*) FROM instances WHERE deploy_id = ?1 \
             GROUP BY deploy_state",
        )?;
        let rows = stmt.query_map(params![deploy_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = DeployStateCounts::default();
        for row in rows {
            let (state, n) = row?;
            match DeployState::parse(&state) {
                DeployState::Pending => counts.pending = n,
                DeployState::Deploying => counts.deploying = n,
                DeployState::Succeeded => counts.succeeded = n,
                DeployState::Failed => counts.failed = n,
                DeployState::RolledBack => counts.rolled_back = n,
                DeployState::Skipped => counts.skipped = n,
                DeployState::Idle => {}
            }
        }
        Ok(counts)
    }
}
